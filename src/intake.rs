//! Intake normalization for every inbound channel.
//!
//! Channels post whatever shape their vendor produces. This module maps those
//! payloads onto a canonical `Lead`:
//! 1. Resolve each canonical field through an alias list
//! 2. Validate email and company (hard failures, never retried)
//! 3. Apply the per source/email rate limit
//! 4. Merge into an open duplicate, or persist a fresh `new` lead
use chrono::{DateTime, Utc};
use moka::future::Cache;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::EngineSettings;
use crate::errors::{AppError, ResultExt};
use crate::locks::{KeyedLocks, LeadLocks};
use crate::models::{Lead, LeadSource, LeadStatus};
use crate::store::LeadStore;

const EMAIL_FIELDS: &[&str] = &[
    "email",
    "email_address",
    "emailAddress",
    "work_email",
    "contact_email",
    "visitor_email",
    "from",
    "sender",
];
const FIRST_NAME_FIELDS: &[&str] = &["first_name", "firstName", "fname", "given_name"];
const LAST_NAME_FIELDS: &[&str] = &["last_name", "lastName", "lname", "surname", "family_name"];
const FULL_NAME_FIELDS: &[&str] = &["name", "full_name", "fullName", "visitor_name", "contact_name"];
const PHONE_FIELDS: &[&str] = &[
    "phone",
    "phone_number",
    "phoneNumber",
    "mobile",
    "telephone",
    "caller_id",
    "from_number",
];
const TITLE_FIELDS: &[&str] = &["title", "job_title", "jobTitle", "role", "position"];
const COMPANY_FIELDS: &[&str] = &[
    "company",
    "company_name",
    "companyName",
    "organization",
    "organisation",
    "employer",
    "account",
];
const INDUSTRY_FIELDS: &[&str] = &["industry", "vertical", "sector"];
const EMPLOYEE_FIELDS: &[&str] = &[
    "employee_count",
    "employees",
    "company_size",
    "companySize",
    "num_employees",
    "headcount",
];
const WEBSITE_FIELDS: &[&str] = &["website", "company_website", "url", "site", "domain"];
const MESSAGE_FIELDS: &[&str] = &[
    "message",
    "body",
    "comments",
    "comment",
    "inquiry",
    "transcript",
    "notes",
    "text",
    "description",
];
const PRODUCT_FIELDS: &[&str] = &["product_interest", "productInterest", "product", "interest", "plan"];
const REGION_FIELDS: &[&str] = &["region", "country", "territory", "location"];
const SOURCE_DETAIL_FIELDS: &[&str] = &[
    "source_detail",
    "campaign",
    "utm_campaign",
    "referrer",
    "referred_by",
    "event_name",
    "partner_name",
];

/// Nested objects some vendors wrap the contact in. Top-level keys win.
const NESTED_OBJECTS: &[&str] = &["contact", "visitor", "lead", "fields"];

const COMPANY_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "llc",
    "ltd",
    "limited",
    "corp",
    "corporation",
    "co",
    "company",
    "gmbh",
    "plc",
    "ag",
    "sa",
];

const MERGE_SEPARATOR: &str = "\n\n---\n\n";

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

fn sender_regex() -> &'static Regex {
    static SENDER: OnceLock<Regex> = OnceLock::new();
    SENDER.get_or_init(|| {
        Regex::new(r#"^\s*"?([^"<]*?)"?\s*<([^>]+)>\s*$"#).expect("sender regex is valid")
    })
}

fn leading_number_regex() -> &'static Regex {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"\d+").expect("number regex is valid"))
}

/// Validate email address (RFC 5322 simplified, dotted domain required).
pub fn is_valid_email(email: &str) -> bool {
    email.len() >= 5 && email.len() <= 254 && email_regex().is_match(email)
}

/// Splits `"Dana Smith <dana@acme.io>"` into name and address.
pub fn parse_sender(raw: &str) -> (Option<String>, String) {
    match sender_regex().captures(raw) {
        Some(caps) => {
            let name = caps
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .filter(|n| !n.is_empty());
            let addr = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            (name, addr)
        }
        None => (None, raw.trim().to_string()),
    }
}

/// First token is the first name, the rest is the last name.
pub fn split_full_name(full: &str) -> (Option<String>, Option<String>) {
    let mut parts = full.split_whitespace();
    let first = parts.next().map(str::to_string);
    let rest: Vec<&str> = parts.collect();
    let last = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };
    (first, last)
}

/// `"500"`, `"1,200"`, `"201-500"` (lower bound) and `"1000+"` all parse.
pub fn parse_employee_count(raw: &str) -> Option<i32> {
    let cleaned = raw.replace([',', '_'], "");
    leading_number_regex()
        .find(&cleaned)
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .map(|n| n.min(i64::from(i32::MAX)) as i32)
}

/// Normalizes to E.164 using `default_region` for national numbers.
///
/// Unparseable or invalid numbers are kept verbatim (trimmed) so nothing the
/// prospect typed is lost.
pub fn normalize_phone(raw: &str, default_region: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let region = default_region.parse::<CountryId>().ok();
    match phonenumber::parse(region, raw) {
        Ok(number) if phonenumber::is_valid(&number) => {
            let formatted = number.format().mode(Mode::E164).to_string();
            tracing::debug!("Normalized phone {} -> {}", raw, formatted);
            Some(formatted)
        }
        Ok(_) | Err(_) => {
            tracing::debug!("Keeping unparseable phone as given: {}", raw);
            Some(raw.to_string())
        }
    }
}

/// Host of `website` without a leading `www.`.
pub fn domain_from_website(website: &str) -> Option<String> {
    let website = website.trim();
    if website.is_empty() {
        return None;
    }
    let with_scheme = if website.contains("://") {
        website.to_string()
    } else {
        format!("https://{}", website)
    };
    let url = url::Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.contains('.') {
        Some(host)
    } else {
        None
    }
}

/// Case/punctuation/legal-suffix insensitive company name.
///
/// `"Acme, Inc."`, `"ACME Inc"` and `"acme"` share the key `"acme"`.
pub fn company_key(company: &str) -> String {
    let lowered: String = company
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = lowered.split_whitespace().collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| COMPANY_SUFFIXES.contains(t)) {
        tokens.pop();
    }
    tokens.join(" ")
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Top-level object followed by the recognised nested wrappers.
fn layers(payload: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let mut layers = vec![payload];
    for key in NESTED_OBJECTS {
        if let Some(Value::Object(nested)) = payload.get(*key) {
            layers.push(nested);
        }
    }
    layers
}

fn lookup(layers: &[&Map<String, Value>], aliases: &[&str]) -> Option<String> {
    layers
        .iter()
        .flat_map(|layer| aliases.iter().filter_map(move |alias| layer.get(*alias)))
        .find_map(text_of)
}

/// Maps a raw channel payload onto a fresh `new` lead.
///
/// Pure apart from id generation: no store access, no rate limiting.
pub fn normalize(
    source: LeadSource,
    payload: &Value,
    received_at: DateTime<Utc>,
    default_phone_region: &str,
) -> Result<Lead, AppError> {
    let object = payload
        .as_object()
        .ok_or_else(|| AppError::Validation("payload must be a JSON object".to_string()))?;
    let layers = layers(object);

    let raw_email = lookup(&layers, EMAIL_FIELDS)
        .ok_or_else(|| AppError::Validation("email is required".to_string()))?;
    let (sender_name, address) = parse_sender(&raw_email);
    let email = address.to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::Validation(format!("invalid email '{}'", raw_email)));
    }

    let company = lookup(&layers, COMPANY_FIELDS)
        .ok_or_else(|| AppError::Validation("company is required".to_string()))?;
    let key = company_key(&company);
    if key.is_empty() {
        return Err(AppError::Validation(format!("invalid company '{}'", company)));
    }

    let mut lead = Lead::new(source, email, company, key, received_at);

    lead.first_name = lookup(&layers, FIRST_NAME_FIELDS);
    lead.last_name = lookup(&layers, LAST_NAME_FIELDS);
    if lead.first_name.is_none() && lead.last_name.is_none() {
        if let Some(full) = lookup(&layers, FULL_NAME_FIELDS).or(sender_name) {
            let (first, last) = split_full_name(&full);
            lead.first_name = first;
            lead.last_name = last;
        }
    }

    lead.phone = lookup(&layers, PHONE_FIELDS)
        .and_then(|raw| normalize_phone(&raw, default_phone_region));
    lead.title = lookup(&layers, TITLE_FIELDS);
    lead.industry = lookup(&layers, INDUSTRY_FIELDS);
    lead.employee_count =
        lookup(&layers, EMPLOYEE_FIELDS).and_then(|raw| parse_employee_count(&raw));
    lead.website = lookup(&layers, WEBSITE_FIELDS);
    lead.domain = lead.website.as_deref().and_then(domain_from_website);
    lead.message = lookup(&layers, MESSAGE_FIELDS);
    lead.product_interest = lookup(&layers, PRODUCT_FIELDS);
    lead.region = lookup(&layers, REGION_FIELDS);
    lead.source_detail = lookup(&layers, SOURCE_DETAIL_FIELDS);

    Ok(lead)
}

/// Folds a duplicate submission into the existing lead.
///
/// The message is appended unless already present verbatim, source detail
/// entries are unioned, and blank contact fields are filled. Nothing set on
/// `existing` is ever overwritten.
pub fn merge_duplicate(existing: &mut Lead, incoming: &Lead) {
    if let Some(message) = incoming.message.as_deref().filter(|m| !m.is_empty()) {
        existing.message = match existing.message.take() {
            None => Some(message.to_string()),
            Some(current) if current.contains(message) => Some(current),
            Some(current) => Some(format!("{}{}{}", current, MERGE_SEPARATOR, message)),
        };
    }

    let mut details: Vec<String> = existing
        .source_detail
        .as_deref()
        .map(|d| d.split("; ").map(str::to_string).collect())
        .unwrap_or_default();
    let mut incoming_details: Vec<String> = incoming
        .source_detail
        .iter()
        .flat_map(|d| d.split("; ").map(str::to_string))
        .collect();
    if incoming.source != existing.source {
        incoming_details.push(format!("also via {}", incoming.source));
    }
    for detail in incoming_details {
        if !detail.is_empty() && !details.contains(&detail) {
            details.push(detail);
        }
    }
    if !details.is_empty() {
        existing.source_detail = Some(details.join("; "));
    }

    fill(&mut existing.first_name, &incoming.first_name);
    fill(&mut existing.last_name, &incoming.last_name);
    fill(&mut existing.phone, &incoming.phone);
    fill(&mut existing.title, &incoming.title);
    fill(&mut existing.industry, &incoming.industry);
    fill(&mut existing.employee_count, &incoming.employee_count);
    fill(&mut existing.website, &incoming.website);
    fill(&mut existing.domain, &incoming.domain);
    fill(&mut existing.product_interest, &incoming.product_interest);
    fill(&mut existing.region, &incoming.region);
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}

/// Fixed-window submission counter per (source, email).
#[derive(Clone)]
pub struct IntakeLimiter {
    counts: Cache<String, Arc<AtomicU32>>,
    max: u32,
}

impl IntakeLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            counts: Cache::builder()
                .time_to_live(window)
                .max_capacity(100_000)
                .build(),
            max,
        }
    }

    pub async fn check(&self, source: LeadSource, email: &str) -> Result<(), AppError> {
        let key = format!("{}:{}", source, email);
        let counter = self
            .counts
            .get_with(key, async { Arc::new(AtomicU32::new(0)) })
            .await;
        let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if seen > self.max {
            tracing::warn!("Rate limited {} submissions from {}", source, email);
            return Err(AppError::RateLimited(format!(
                "too many {} submissions for {}",
                source, email
            )));
        }
        Ok(())
    }
}

/// Result of a successful intake.
#[derive(Debug, Clone)]
pub enum IntakeOutcome {
    /// A fresh lead in status `new`, not yet scored.
    Created(Lead),
    /// Merged into an open lead for the same email and company.
    Duplicate(Lead),
}

impl IntakeOutcome {
    pub fn lead(&self) -> &Lead {
        match self {
            IntakeOutcome::Created(lead) | IntakeOutcome::Duplicate(lead) => lead,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IntakeOutcome::Duplicate(_))
    }
}

pub struct IntakeNormalizer {
    store: Arc<dyn LeadStore>,
    lead_locks: LeadLocks,
    dedupe_locks: KeyedLocks<String>,
    limiter: IntakeLimiter,
    dedupe_window: chrono::Duration,
    default_phone_region: String,
}

impl IntakeNormalizer {
    pub fn new(store: Arc<dyn LeadStore>, lead_locks: LeadLocks, settings: &EngineSettings) -> Self {
        Self {
            store,
            lead_locks,
            dedupe_locks: KeyedLocks::new(Duration::from_secs(60)),
            limiter: IntakeLimiter::new(settings.rate_limit_max, settings.rate_limit_window),
            dedupe_window: settings.dedupe_window,
            default_phone_region: settings.default_phone_region.clone(),
        }
    }

    pub async fn ingest(&self, source: LeadSource, payload: &Value) -> Result<IntakeOutcome, AppError> {
        let received_at = Utc::now();
        let candidate = normalize(source, payload, received_at, &self.default_phone_region)?;
        self.limiter.check(source, &candidate.email).await?;

        // Serializes concurrent submissions of the same pair so only one
        // of them can create the lead.
        let dedupe_key = format!("{}|{}", candidate.email, candidate.company_key);
        let _dedupe_guard = self.dedupe_locks.lock(dedupe_key).await;

        let since = received_at - self.dedupe_window;
        if let Some(existing) = self
            .store
            .find_open_duplicate(&candidate.email, &candidate.company_key, since)
            .await?
        {
            let _lead_guard = self.lead_locks.lock(existing.id).await;
            if let Some(mut current) = self.store.get_lead(existing.id).await? {
                if current.status != LeadStatus::Disqualified {
                    merge_duplicate(&mut current, &candidate);
                    let merged = self
                        .store
                        .update_lead(&current)
                        .await
                        .with_context(|| format!("merging duplicate into lead {}", current.id))?;
                    tracing::info!(
                        "Merged duplicate {} submission into lead {} ({})",
                        source,
                        merged.id,
                        merged.status
                    );
                    return Ok(IntakeOutcome::Duplicate(merged));
                }
            }
        }

        self.store.insert_lead(&candidate).await?;
        tracing::info!(
            "Lead {} created from {} for {}",
            candidate.id,
            source,
            candidate.company
        );
        Ok(IntakeOutcome::Created(candidate))
    }
}
