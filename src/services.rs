use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache_validator::ChecksummedCache;
use crate::circuit_breaker::{create_service_circuit_breaker, guarded, ServiceBreaker};
use crate::content::{ContentIntelligence, ContentRequest, ContentVariant, GeneratedContent};
use crate::errors::AppError;

// ============ Company Intel ============

/// Firmographics returned by the company-intel provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub recent_news: Vec<String>,
    /// Annual revenue estimate in USD.
    #[serde(default)]
    pub estimated_revenue: Option<f64>,
    #[serde(default)]
    pub employee_count: Option<i32>,
}

#[async_trait]
pub trait CompanyIntel: Send + Sync {
    async fn lookup(&self, company: &str, domain: Option<&str>) -> Result<CompanyProfile, AppError>;
}

pub struct HttpCompanyIntel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    cache: ChecksummedCache<CompanyProfile>,
    breaker: ServiceBreaker,
}

impl HttpCompanyIntel {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::ExternalApiError(format!("Failed to create company intel client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            // 1 hour TTL, 10k companies
            cache: ChecksummedCache::new(Duration::from_secs(3600), 10_000),
            breaker: create_service_circuit_breaker(),
        })
    }

    fn cache_key(company: &str, domain: Option<&str>) -> String {
        match domain {
            Some(domain) => format!("domain:{}", domain.to_lowercase()),
            None => format!("company:{}", company.trim().to_lowercase()),
        }
    }

    async fn fetch(&self, company: &str, domain: Option<&str>) -> Result<CompanyProfile, AppError> {
        let mut params = vec![("company", company)];
        if let Some(domain) = domain {
            params.push(("domain", domain));
        }
        // Build URL with proper parameter encoding
        let url = reqwest::Url::parse_with_params(
            &format!("{}/companies/lookup", self.base_url),
            &params,
        )
        .map_err(|e| AppError::EnrichmentUnavailable(format!("Failed to build URL: {}", e)))?;

        tracing::info!("Looking up company intel for '{}' ({:?})", company, domain);

        let mut request = self.client.get(url);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            AppError::EnrichmentUnavailable(format!("Company intel request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::EnrichmentUnavailable(format!(
                "Company intel returned status {}: {}",
                status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            AppError::EnrichmentUnavailable(format!("Failed to parse company intel response: {}", e))
        })
    }
}

#[async_trait]
impl CompanyIntel for HttpCompanyIntel {
    async fn lookup(&self, company: &str, domain: Option<&str>) -> Result<CompanyProfile, AppError> {
        let key = Self::cache_key(company, domain);
        if let Some(profile) = self.cache.get(&key).await {
            tracing::debug!("Company intel cache hit: {}", key);
            return Ok(profile);
        }

        let profile = guarded(&self.breaker, "company intel", self.fetch(company, domain))
            .await
            .map_err(|e| match e {
                AppError::EnrichmentUnavailable(_) => e,
                other => AppError::EnrichmentUnavailable(other.to_string()),
            })?;

        self.cache.insert(key, &profile).await;
        Ok(profile)
    }
}

// ============ Content Intelligence ============

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a ContentRequest,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    variants: Vec<ContentVariant>,
    #[serde(default)]
    model: Option<String>,
}

pub struct HttpContentIntelligence {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    breaker: ServiceBreaker,
}

impl HttpContentIntelligence {
    /// `timeout` is a transport ceiling; the dispatcher applies the tighter
    /// SLA-derived budget on top of it.
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::ExternalApiError(format!("Failed to create content client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model,
            breaker: create_service_circuit_breaker(),
        })
    }

    async fn post_generate(&self, request: &ContentRequest) -> Result<GeneratedContent, AppError> {
        let url = format!("{}/generate", self.base_url);
        tracing::info!(
            "Requesting {} content ({} variant(s)) for {}",
            request.sequence_type,
            request.variant_count,
            request.lead.company
        );

        let body = GenerateBody {
            model: &self.model,
            request,
        };
        let mut http = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            http = http.bearer_auth(key);
        }
        let response = http.send().await.map_err(|e| {
            AppError::ContentGeneration(format!("Content request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ContentGeneration(format!(
                "Content Intelligence returned status {}: {}",
                status, error_text
            )));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            AppError::ContentGeneration(format!("Failed to parse content response: {}", e))
        })?;

        let variants: Vec<ContentVariant> = parsed
            .variants
            .into_iter()
            .filter(|v| !v.body.trim().is_empty())
            .collect();
        if variants.is_empty() {
            return Err(AppError::ContentGeneration(
                "Content Intelligence returned no usable variants".to_string(),
            ));
        }

        Ok(GeneratedContent {
            variants,
            model_id: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[async_trait]
impl ContentIntelligence for HttpContentIntelligence {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent, AppError> {
        guarded(&self.breaker, "content intelligence", self.post_generate(request))
            .await
            .map_err(|e| match e {
                AppError::ContentGeneration(_) => e,
                other => AppError::ContentGeneration(other.to_string()),
            })
    }
}
