//! Content Intelligence capability and the deterministic template fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::{Lead, ResponseChannel};
use crate::scoring::ScoreTier;

pub const TEMPLATE_MODEL_ID: &str = "template-v1";
pub const TEMPLATE_CONFIDENCE: f64 = 0.5;
/// Used when the generator does not report a confidence of its own.
pub const DEFAULT_AI_CONFIDENCE: f64 = 0.8;

/// What the generator is allowed to see about a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub title: Option<String>,
    pub company: String,
    pub industry: Option<String>,
    pub employee_count: Option<i32>,
    pub message: Option<String>,
    pub product_interest: Option<String>,
    pub source: String,
    pub score: Option<i32>,
    pub tier: ScoreTier,
}

impl From<&Lead> for LeadSnapshot {
    fn from(lead: &Lead) -> Self {
        Self {
            first_name: lead.first_name.clone(),
            last_name: lead.last_name.clone(),
            title: lead.title.clone(),
            company: lead.company.clone(),
            industry: lead.industry.clone(),
            employee_count: lead.employee_count,
            message: lead.message.clone(),
            product_interest: lead.product_interest.clone(),
            source: lead.source.to_string(),
            score: lead.score,
            tier: ScoreTier::for_score(lead.score.unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentRequest {
    pub lead: LeadSnapshot,
    pub sequence_type: String,
    pub tone: String,
    pub variant_count: u8,
    pub channel: ResponseChannel,
}

impl ContentRequest {
    /// First-touch request for a speed-to-lead reply.
    pub fn speed_to_lead(lead: &Lead, channel: ResponseChannel) -> Self {
        let snapshot = LeadSnapshot::from(lead);
        let tone = match snapshot.tier {
            ScoreTier::Hot => "direct",
            ScoreTier::Warm => "consultative",
            ScoreTier::Nurture => "helpful",
        };
        Self {
            lead: snapshot,
            sequence_type: "speed_to_lead".to_string(),
            tone: tone.to_string(),
            variant_count: 1,
            channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVariant {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub personalization_points: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContent {
    pub variants: Vec<ContentVariant>,
    pub model_id: String,
}

#[async_trait]
pub trait ContentIntelligence: Send + Sync {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent, AppError>;
}

/// Renders tier/channel templates. Never fails, never does I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateContent;

impl TemplateContent {
    pub fn render(&self, request: &ContentRequest) -> ContentVariant {
        let lead = &request.lead;
        let greeting = match lead.first_name.as_deref() {
            Some(name) => format!("Hi {},", name),
            None => "Hi there,".to_string(),
        };
        let topic = lead
            .product_interest
            .clone()
            .unwrap_or_else(|| "our platform".to_string());

        let (subject, core) = match lead.tier {
            ScoreTier::Hot => (
                format!("Next steps for {}", lead.company),
                format!(
                    "Thanks for reaching out about {}. A specialist is reviewing your request now \
                     and will contact you shortly to set up a working session for the {} team.",
                    topic, lead.company
                ),
            ),
            ScoreTier::Warm => (
                format!("Your question about {}", topic),
                format!(
                    "Thanks for your interest in {}. We'd be glad to walk you through how teams \
                     like {} use it. Reply with a time that works and we'll set up a short call.",
                    topic, lead.company
                ),
            ),
            ScoreTier::Nurture => (
                "Thanks for getting in touch".to_string(),
                format!(
                    "Thanks for your note about {}. We've shared a few resources below that \
                     answer the most common questions, and you can reply here any time.",
                    topic
                ),
            ),
        };

        let body = match request.channel {
            ResponseChannel::Email => format!("{}\n\n{}\n\nBest regards,\nThe Sales Team", greeting, core),
            ResponseChannel::Chat | ResponseChannel::Sms => format!("{} {}", greeting, core),
        };

        let mut personalization_points = vec![format!("company: {}", lead.company)];
        if lead.first_name.is_some() {
            personalization_points.push("first name".to_string());
        }
        if lead.product_interest.is_some() {
            personalization_points.push(format!("product interest: {}", topic));
        }

        ContentVariant {
            subject,
            body,
            personalization_points,
            confidence: Some(TEMPLATE_CONFIDENCE),
        }
    }
}

#[async_trait]
impl ContentIntelligence for TemplateContent {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent, AppError> {
        Ok(GeneratedContent {
            variants: vec![self.render(request)],
            model_id: TEMPLATE_MODEL_ID.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LeadSource;
    use chrono::Utc;

    fn scored_lead(score: i32) -> Lead {
        let mut lead = Lead::new(
            LeadSource::WebsiteForm,
            "dana@acme.io".into(),
            "Acme".into(),
            "acme".into(),
            Utc::now(),
        );
        lead.first_name = Some("Dana".into());
        lead.score = Some(score);
        lead
    }

    #[test]
    fn test_template_varies_by_tier() {
        let hot = TemplateContent.render(&ContentRequest::speed_to_lead(
            &scored_lead(90),
            ResponseChannel::Email,
        ));
        let nurture = TemplateContent.render(&ContentRequest::speed_to_lead(
            &scored_lead(10),
            ResponseChannel::Email,
        ));
        assert_eq!(hot.subject, "Next steps for Acme");
        assert_eq!(nurture.subject, "Thanks for getting in touch");
        assert!(hot.body.starts_with("Hi Dana,"));
        assert_eq!(hot.confidence, Some(TEMPLATE_CONFIDENCE));
    }

    #[test]
    fn test_sms_template_has_no_signature() {
        let sms = TemplateContent.render(&ContentRequest::speed_to_lead(
            &scored_lead(60),
            ResponseChannel::Sms,
        ));
        assert!(!sms.body.contains('\n'));
    }

    #[test]
    fn test_template_is_deterministic() {
        let request = ContentRequest::speed_to_lead(&scored_lead(60), ResponseChannel::Chat);
        assert_eq!(TemplateContent.render(&request), TemplateContent.render(&request));
    }
}
