use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ Enumerations ============

/// Inbound channel a lead arrived through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "lead_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    WebsiteForm,
    Chat,
    Email,
    Phone,
    Event,
    Referral,
    Partner,
    Social,
}

impl LeadSource {
    pub const ALL: [LeadSource; 8] = [
        LeadSource::WebsiteForm,
        LeadSource::Chat,
        LeadSource::Email,
        LeadSource::Phone,
        LeadSource::Event,
        LeadSource::Referral,
        LeadSource::Partner,
        LeadSource::Social,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadSource::WebsiteForm => "website_form",
            LeadSource::Chat => "chat",
            LeadSource::Email => "email",
            LeadSource::Phone => "phone",
            LeadSource::Event => "event",
            LeadSource::Referral => "referral",
            LeadSource::Partner => "partner",
            LeadSource::Social => "social",
        }
    }
}

impl fmt::Display for LeadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadSource {
    type Err = String;

    /// Accepts the canonical names plus the dashed/short spellings channels send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "website_form" | "website" | "web" | "form" => Ok(LeadSource::WebsiteForm),
            "chat" | "live_chat" => Ok(LeadSource::Chat),
            "email" | "inbound_email" => Ok(LeadSource::Email),
            "phone" | "call" => Ok(LeadSource::Phone),
            "event" | "events" => Ok(LeadSource::Event),
            "referral" => Ok(LeadSource::Referral),
            "partner" => Ok(LeadSource::Partner),
            "social" => Ok(LeadSource::Social),
            other => Err(format!("Unknown lead source '{}'", other)),
        }
    }
}

/// Lifecycle status. The only legal moves between these are listed in
/// `lifecycle::ALLOWED_TRANSITIONS`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "lead_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    AutoResponded,
    SdrReview,
    Qualified,
    Disqualified,
    Converted,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 6] = [
        LeadStatus::New,
        LeadStatus::AutoResponded,
        LeadStatus::SdrReview,
        LeadStatus::Qualified,
        LeadStatus::Disqualified,
        LeadStatus::Converted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::AutoResponded => "auto_responded",
            LeadStatus::SdrReview => "sdr_review",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Disqualified => "disqualified",
            LeadStatus::Converted => "converted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Disqualified | LeadStatus::Converted)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LeadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown lead status '{}'", s))
    }
}

/// Channel an auto-response went out on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "response_channel", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResponseChannel {
    Email,
    Chat,
    Sms,
}

impl ResponseChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseChannel::Email => "email",
            ResponseChannel::Chat => "chat",
            ResponseChannel::Sms => "sms",
        }
    }
}

impl fmt::Display for ResponseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who applied a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The Response Dispatcher.
    Dispatcher,
    /// A human SDR/AE working the queue.
    Reviewer,
    /// An automated engine rule.
    Rule,
    /// The Conversion Service.
    Conversion,
}

/// What caused a (re)score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTrigger {
    Intake,
    Manual,
    Retry,
}

// ============ Lead ============

/// One entry of the score audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreChange {
    pub previous: Option<i32>,
    pub new: i32,
    pub provisional: bool,
    pub trigger: ScoreTrigger,
    pub at: DateTime<Utc>,
}

/// One entry of the status audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: LeadStatus,
    pub to: LeadStatus,
    pub actor: Actor,
    pub at: DateTime<Utc>,
}

/// Canonical inbound sales inquiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,

    // Source
    pub source: LeadSource,
    pub source_detail: Option<String>,

    // Contact
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Lower-cased; half of the dedupe key.
    pub email: String,
    /// E.164 when it could be parsed, raw otherwise.
    pub phone: Option<String>,
    pub title: Option<String>,
    pub company: String,
    /// Normalized company name; the other half of the dedupe key.
    pub company_key: String,
    pub industry: Option<String>,
    pub employee_count: Option<i32>,
    pub website: Option<String>,
    pub domain: Option<String>,

    // Inquiry
    pub message: Option<String>,
    pub product_interest: Option<String>,
    pub region: Option<String>,

    // Scoring
    pub score: Option<i32>,
    pub score_factors: Vec<String>,
    pub ai_summary: Option<String>,
    pub qualified_by_ai: bool,
    pub score_provisional: bool,
    pub score_history: Vec<ScoreChange>,

    // Response tracking (first response)
    pub response_sent: bool,
    pub response_body: Option<String>,
    pub response_channel: Option<ResponseChannel>,
    pub response_sent_at: Option<DateTime<Utc>>,
    pub response_time_ms: Option<i64>,

    // Lifecycle
    pub status: LeadStatus,
    pub sdr_id: Option<String>,
    pub ae_id: Option<String>,
    pub converted_account_id: Option<Uuid>,
    pub converted_deal_id: Option<Uuid>,
    pub qualified_at: Option<DateTime<Utc>>,
    pub disqualified_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
    pub qualification_notes: Option<String>,
    pub status_history: Vec<StatusChange>,

    // Delivery bookkeeping
    pub dispatch_attempts: i32,
    pub needs_follow_up: bool,
    pub last_delivery_error: Option<String>,

    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// A fresh `new` lead with only the required fields set.
    pub fn new(
        source: LeadSource,
        email: String,
        company: String,
        company_key: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at,
            source,
            source_detail: None,
            first_name: None,
            last_name: None,
            email,
            phone: None,
            title: None,
            company,
            company_key,
            industry: None,
            employee_count: None,
            website: None,
            domain: None,
            message: None,
            product_interest: None,
            region: None,
            score: None,
            score_factors: Vec::new(),
            ai_summary: None,
            qualified_by_ai: false,
            score_provisional: false,
            score_history: Vec::new(),
            response_sent: false,
            response_body: None,
            response_channel: None,
            response_sent_at: None,
            response_time_ms: None,
            status: LeadStatus::New,
            sdr_id: None,
            ae_id: None,
            converted_account_id: None,
            converted_deal_id: None,
            qualified_at: None,
            disqualified_at: None,
            converted_at: None,
            qualification_notes: None,
            status_history: Vec::new(),
            dispatch_attempts: 0,
            needs_follow_up: false,
            last_delivery_error: None,
            version: 1,
            updated_at: received_at,
        }
    }

    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    /// Domain part of the contact email.
    pub fn email_domain(&self) -> Option<&str> {
        self.email.rsplit_once('@').map(|(_, domain)| domain)
    }

    pub fn is_scored(&self) -> bool {
        self.score.is_some()
    }
}

// ============ AutoResponse / Account / Deal ============

/// A response that was accepted by the outbound transport.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AutoResponse {
    pub id: Uuid,
    pub lead_id: Uuid,
    /// Dispatch ordinal the idempotency key was derived from.
    pub attempt: i32,
    pub idempotency_key: String,
    pub subject: String,
    pub body: String,
    pub channel: ResponseChannel,
    /// Snapshot of what the message was personalized with.
    pub personalization: serde_json::Value,
    pub sent_at: DateTime<Utc>,
    pub opened: bool,
    pub replied: bool,
    pub confidence: f64,
    pub model_id: String,
    pub fallback_used: bool,
    pub transport_attempts: i32,
    /// Only set on the lead's first response.
    pub response_time_ms: Option<i64>,
    pub sla_met: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Domain when known, otherwise the normalized company name.
    pub account_key: String,
    pub name: String,
    pub domain: Option<String>,
    pub industry: Option<String>,
    pub employee_count: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub account_id: Uuid,
    pub lead_id: Uuid,
    pub name: String,
    pub product_interest: Option<String>,
    pub estimated_seats: i32,
    pub estimated_value: BigDecimal,
    pub owner_id: Option<String>,
    pub stage: String,
    pub created_at: DateTime<Utc>,
}

// ============ API Request/Response Models ============

/// Filters for `GET /api/v1/leads`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadQuery {
    pub status: Option<LeadStatus>,
    pub source: Option<LeadSource>,
    /// Case-insensitive match on name, email or company.
    pub search: Option<String>,
    pub min_score: Option<i32>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl LeadQuery {
    pub const DEFAULT_PER_PAGE: u32 = 25;
    pub const MAX_PER_PAGE: u32 = 200;

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
            .unwrap_or(Self::DEFAULT_PER_PAGE)
            .clamp(1, Self::MAX_PER_PAGE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.per_page())
    }

    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    /// In-memory equivalent of the SQL filter.
    pub fn matches(&self, lead: &Lead) -> bool {
        if self.status.is_some_and(|s| s != lead.status) {
            return false;
        }
        if self.source.is_some_and(|s| s != lead.source) {
            return false;
        }
        if let Some(min) = self.min_score {
            if lead.score.map_or(true, |score| score < min) {
                return false;
            }
        }
        if let Some(term) = self.search_term() {
            let haystack = format!(
                "{} {} {}",
                lead.full_name().unwrap_or_default(),
                lead.email,
                lead.company
            )
            .to_lowercase();
            if !haystack.contains(&term) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadPage {
    pub leads: Vec<Lead>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Which commands are legal for a lead right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllowedActions {
    pub claim: bool,
    pub qualify: bool,
    pub disqualify: bool,
    pub convert: bool,
    pub respond: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadDetail {
    pub lead: Lead,
    pub auto_responses: Vec<AutoResponse>,
    pub allowed_actions: AllowedActions,
    /// "provisional" or "final"; absent until the first score lands.
    pub score_state: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeResponse {
    pub lead_id: Uuid,
    pub status: LeadStatus,
    pub duplicate: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub sdr_id: String,
}

#[derive(Debug, Deserialize)]
pub struct QualifyRequest {
    pub notes: String,
    /// Optional AE handoff, written together with the status change.
    pub ae_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisqualifyRequest {
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub lead_id: Uuid,
    pub account_id: Uuid,
    pub deal_id: Uuid,
    /// False when an existing account was reused.
    pub account_created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_source_parses_aliases() {
        assert_eq!(
            "website-form".parse::<LeadSource>().unwrap(),
            LeadSource::WebsiteForm
        );
        assert_eq!("Web".parse::<LeadSource>().unwrap(), LeadSource::WebsiteForm);
        assert_eq!("call".parse::<LeadSource>().unwrap(), LeadSource::Phone);
        assert!("carrier-pigeon".parse::<LeadSource>().is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in LeadStatus::ALL {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&LeadStatus::AutoResponded).unwrap();
        assert_eq!(json, "\"auto_responded\"");
    }

    #[test]
    fn test_query_pagination_clamps() {
        let query = LeadQuery {
            page: Some(0),
            per_page: Some(10_000),
            ..Default::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.per_page(), LeadQuery::MAX_PER_PAGE);
        assert_eq!(query.offset(), 0);

        let query = LeadQuery {
            page: Some(3),
            per_page: Some(20),
            ..Default::default()
        };
        assert_eq!(query.offset(), 40);
    }
}
