use bigdecimal::BigDecimal;
use std::str::FromStr;
use std::time::Duration;

/// Tunables of the lead engine. `Default` holds the production defaults;
/// `EngineSettings::from_env` overrides them from the environment.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Minimum score for `qualified_by_ai`.
    pub qualification_threshold: i32,
    /// Speed-to-lead deadline measured from `received_at`.
    pub response_sla: Duration,
    /// Upper bound on a whole scoring run.
    pub scoring_timeout: Duration,
    /// Upper bound on the company-intel lookup inside a scoring run.
    pub enrichment_timeout: Duration,
    /// Upper bound on a Content Intelligence call (further capped by the SLA).
    pub content_timeout: Duration,
    /// Time reserved for the transport send when budgeting content generation.
    pub send_reserve: Duration,
    /// Window for the email+company dedupe invariant.
    pub dedupe_window: chrono::Duration,
    /// Submissions allowed per source/email pair within `rate_limit_window`.
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    /// Transport tries per dispatch.
    pub delivery_max_attempts: u32,
    pub delivery_backoff: Duration,
    /// Async re-score tries after a scoring timeout.
    pub scoring_retry_attempts: u32,
    pub scoring_retry_backoff: Duration,
    /// Lower-cased industries that earn the fit bonus.
    pub target_industries: Vec<String>,
    /// Per-seat price used to seed deal value.
    pub seat_price: BigDecimal,
    /// Disqualify leads carrying a non-commercial signal without human review.
    pub auto_disqualify_non_commercial: bool,
    /// Default region for parsing phone numbers without a country code.
    pub default_phone_region: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            qualification_threshold: 60,
            response_sla: Duration::from_secs(30),
            scoring_timeout: Duration::from_secs(5),
            enrichment_timeout: Duration::from_secs(3),
            content_timeout: Duration::from_secs(20),
            send_reserve: Duration::from_secs(5),
            dedupe_window: chrono::Duration::days(30),
            rate_limit_max: 5,
            rate_limit_window: Duration::from_secs(600),
            delivery_max_attempts: 3,
            delivery_backoff: Duration::from_millis(500),
            scoring_retry_attempts: 3,
            scoring_retry_backoff: Duration::from_secs(2),
            target_industries: vec![
                "software".to_string(),
                "logistics".to_string(),
                "manufacturing".to_string(),
                "healthcare".to_string(),
                "retail".to_string(),
                "financial services".to_string(),
            ],
            seat_price: BigDecimal::from(1200),
            auto_disqualify_non_commercial: false,
            default_phone_region: "US".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; the engine runs on the in-memory store when absent.
    pub database_url: Option<String>,
    pub port: u16,
    pub webhook_secret: Option<String>,
    pub content_api_url: Option<String>,
    pub content_api_key: Option<String>,
    pub content_model: String,
    pub company_intel_url: Option<String>,
    pub company_intel_key: Option<String>,
    pub outbound_relay_url: Option<String>,
    pub outbound_relay_token: Option<String>,
    pub engine: EngineSettings,
}

impl EngineSettings {
    /// Production defaults overridden by whatever the environment sets.
    /// Shared by the service and the reporting tools so both agree on the SLA.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = EngineSettings::default();

        Ok(EngineSettings {
            qualification_threshold: env_parse("QUALIFICATION_THRESHOLD")?
                .map(|t: i32| {
                    if !(0..=100).contains(&t) {
                        anyhow::bail!("QUALIFICATION_THRESHOLD must be between 0 and 100");
                    }
                    Ok(t)
                })
                .transpose()?
                .unwrap_or(defaults.qualification_threshold),
            response_sla: env_parse("RESPONSE_SLA_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.response_sla),
            scoring_timeout: env_parse("SCORING_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.scoring_timeout),
            enrichment_timeout: env_parse("ENRICHMENT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.enrichment_timeout),
            content_timeout: env_parse("CONTENT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.content_timeout),
            send_reserve: defaults.send_reserve,
            dedupe_window: env_parse("DEDUPE_WINDOW_DAYS")?
                .map(chrono::Duration::days)
                .unwrap_or(defaults.dedupe_window),
            rate_limit_max: env_parse("RATE_LIMIT_MAX")?.unwrap_or(defaults.rate_limit_max),
            rate_limit_window: env_parse("RATE_LIMIT_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            delivery_max_attempts: env_parse("DELIVERY_MAX_ATTEMPTS")?
                .map(|n: u32| n.max(1))
                .unwrap_or(defaults.delivery_max_attempts),
            delivery_backoff: env_parse("DELIVERY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.delivery_backoff),
            scoring_retry_attempts: defaults.scoring_retry_attempts,
            scoring_retry_backoff: defaults.scoring_retry_backoff,
            target_industries: std::env::var("TARGET_INDUSTRIES")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|list| {
                    list.split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.target_industries),
            seat_price: std::env::var("SEAT_PRICE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    BigDecimal::from_str(s.trim())
                        .map_err(|_| anyhow::anyhow!("SEAT_PRICE must be a decimal number"))
                })
                .transpose()?
                .unwrap_or(defaults.seat_price),
            auto_disqualify_non_commercial: env_parse("AUTO_DISQUALIFY_NON_COMMERCIAL")?
                .unwrap_or(defaults.auto_disqualify_non_commercial),
            default_phone_region: std::env::var("DEFAULT_PHONE_REGION")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_uppercase())
                .unwrap_or(defaults.default_phone_region),
        })
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let engine = EngineSettings::from_env()?;

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            webhook_secret: optional_var("WEBHOOK_SECRET"),
            content_api_url: optional_http_url("CONTENT_API_URL")?,
            content_api_key: optional_var("CONTENT_API_KEY"),
            content_model: optional_var("CONTENT_MODEL")
                .unwrap_or_else(|| "content-intel-v1".to_string()),
            company_intel_url: optional_http_url("COMPANY_INTEL_URL")?,
            company_intel_key: optional_var("COMPANY_INTEL_KEY"),
            outbound_relay_url: optional_http_url("OUTBOUND_RELAY_URL")?,
            outbound_relay_token: optional_var("OUTBOUND_RELAY_TOKEN"),
            engine,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        match config.database_url {
            Some(ref url) => {
                tracing::debug!("Database URL: {}...", redacted_prefix(url, 20));
            }
            None => tracing::warn!("No DATABASE_URL set, leads are kept in memory only"),
        }
        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set, channel webhooks are unauthenticated");
        }
        tracing::debug!("Content Intelligence URL: {:?}", config.content_api_url);
        tracing::debug!("Company intel URL: {:?}", config.company_intel_url);
        tracing::debug!("Outbound relay URL: {:?}", config.outbound_relay_url);
        tracing::debug!(
            "Engine: threshold={}, sla={:?}, dedupe_window={}d",
            config.engine.qualification_threshold,
            config.engine.response_sla,
            config.engine.dedupe_window.num_days()
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

/// First `max` characters of `value`, safe for any UTF-8 input.
fn redacted_prefix(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn optional_http_url(key: &str) -> anyhow::Result<Option<String>> {
    optional_var(key)
        .map(|url| {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", key);
            }
            Ok(url.trim_end_matches('/').to_string())
        })
        .transpose()
}

fn env_parse<T: FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    optional_var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", key, raw))
        })
        .transpose()
}
