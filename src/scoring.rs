//! Rule-based lead scoring with optional company-intel enrichment.
//!
//! The rules are additive and deterministic: identical lead fields and
//! identical intel always produce the same score, factors and summary.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::EngineSettings;
use crate::models::{Lead, LeadSource, ScoreChange, ScoreTrigger};
use crate::services::{CompanyIntel, CompanyProfile};

/// Ceiling applied when a non-commercial signal is present.
pub const NON_COMMERCIAL_CEILING: i32 = 15;
pub const TIMED_OUT_FACTOR: &str = "scoring timed out";
const REVENUE_BONUS_THRESHOLD: f64 = 10_000_000.0;
const DETAILED_MESSAGE_CHARS: usize = 80;

const FREE_MAILBOXES: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "aol.com",
    "icloud.com",
    "me.com",
    "proton.me",
    "protonmail.com",
    "gmx.com",
    "mail.com",
    "yandex.com",
    "zoho.com",
];

/// Company names that say "nobody is buying".
const PLACEHOLDER_COMPANIES: &[&str] = &[
    "university",
    "college",
    "school",
    "personal",
    "self",
    "self employed",
    "none",
    "n a",
    "na",
    "student",
    "individual",
    "private",
    "home",
    "test",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTier {
    Hot,
    Warm,
    Nurture,
}

impl ScoreTier {
    pub fn for_score(score: i32) -> Self {
        match score {
            s if s >= 80 => ScoreTier::Hot,
            s if s >= 50 => ScoreTier::Warm,
            _ => ScoreTier::Nurture,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreTier::Hot => "hot",
            ScoreTier::Warm => "warm",
            ScoreTier::Nurture => "nurture",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub score: i32,
    /// Human-readable factors in rule order.
    pub factors: Vec<String>,
    pub summary: String,
    pub qualified: bool,
    /// Missing intel or a timeout; a later run may replace it.
    pub provisional: bool,
    /// A non-commercial signal capped the score.
    pub disqualifying: bool,
    pub timed_out: bool,
}

impl ScoreResult {
    pub fn timed_out() -> Self {
        Self {
            score: 0,
            factors: vec![TIMED_OUT_FACTOR.to_string()],
            summary: "Scoring did not finish in time; a retry is scheduled.".to_string(),
            qualified: false,
            provisional: true,
            disqualifying: false,
            timed_out: true,
        }
    }

    pub fn tier(&self) -> ScoreTier {
        ScoreTier::for_score(self.score)
    }
}

/// Writes a result onto the lead. History grows only when the score or its
/// provisional flag actually changed, so re-scoring identical inputs is a no-op.
pub fn apply_score(lead: &mut Lead, result: &ScoreResult, trigger: ScoreTrigger, at: DateTime<Utc>) {
    let changed = lead.score != Some(result.score) || lead.score_provisional != result.provisional;
    if changed {
        lead.score_history.push(ScoreChange {
            previous: lead.score,
            new: result.score,
            provisional: result.provisional,
            trigger,
            at,
        });
    }
    lead.score = Some(result.score);
    lead.score_factors = result.factors.clone();
    lead.ai_summary = Some(result.summary.clone());
    lead.qualified_by_ai = result.qualified;
    lead.score_provisional = result.provisional;
}

struct Patterns {
    vp: Regex,
    c_level: Regex,
    director: Regex,
    manager: Regex,
    student: Regex,
    urgency: Regex,
    budget: Regex,
    multi: Regex,
    pain: Regex,
    non_commercial: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("scoring pattern is valid");
        Patterns {
            vp: re(r"\b(vp|svp|evp|avp|vice[ -]president)\b"),
            c_level: re(r"\b(ceo|cto|cfo|coo|cio|cmo|cro|ciso|chief|founder|co-founder|cofounder|owner|president)\b"),
            director: re(r"\b(director|head)\b"),
            manager: re(r"\b(manager|lead|supervisor)\b"),
            student: re(r"\b(student|intern|undergraduate|phd candidate)\b"),
            urgency: re(r"\b(asap|urgent|urgently|immediately|right away|as soon as possible|this week|this month|this quarter|next week|deadline|time[- ]sensitive)\b"),
            budget: re(r"\b(budget|budgeted|approved|funding|funded|pricing|quote|purchase order|procurement)\b"),
            multi: re(r"\b(multi[- ]?site|multi[- ]?location|multiple (sites|locations|offices|warehouses|plants|stores|teams|products)|company[- ]wide|enterprise[- ]wide|\d+\s+(sites|locations|offices|warehouses|plants|stores|facilities|seats|users|licenses|agents))\b"),
            pain: re(r"\b(struggling|pain|problem|bottleneck|manual process|spreadsheets?|inefficien\w*|downtime|delays?|backlog|visibility|losing|churn)\b"),
            non_commercial: re(r"\b(thesis|dissertation|homework|assignment|class project|school project|personal project|student project|coursework|research paper)\b"),
        }
    })
}

pub struct ScoringEngine {
    intel: Option<Arc<dyn CompanyIntel>>,
    threshold: i32,
    target_industries: Vec<String>,
    scoring_timeout: Duration,
    enrichment_timeout: Duration,
}

impl ScoringEngine {
    pub fn new(settings: &EngineSettings, intel: Option<Arc<dyn CompanyIntel>>) -> Self {
        Self {
            intel,
            threshold: settings.qualification_threshold,
            target_industries: settings
                .target_industries
                .iter()
                .map(|i| i.to_lowercase())
                .collect(),
            scoring_timeout: settings.scoring_timeout,
            enrichment_timeout: settings.enrichment_timeout,
        }
    }

    /// Full scoring run, bounded by the scoring timeout.
    ///
    /// Never fails: intel errors degrade to a provisional rules-only score and
    /// a timeout yields `ScoreResult::timed_out()`.
    pub async fn score(&self, lead: &Lead) -> ScoreResult {
        match tokio::time::timeout(self.scoring_timeout, self.score_with_intel(lead)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Scoring lead {} exceeded {:?}",
                    lead.id,
                    self.scoring_timeout
                );
                ScoreResult::timed_out()
            }
        }
    }

    async fn score_with_intel(&self, lead: &Lead) -> ScoreResult {
        let Some(intel) = self.intel.as_ref() else {
            return self.score_rules(lead, None, false);
        };

        let lookup = intel.lookup(&lead.company, lead.domain.as_deref());
        match tokio::time::timeout(self.enrichment_timeout, lookup).await {
            Ok(Ok(profile)) => self.score_rules(lead, Some(&profile), false),
            Ok(Err(e)) => {
                tracing::warn!("Company intel unavailable for lead {}: {}", lead.id, e);
                self.score_rules(lead, None, true)
            }
            Err(_) => {
                tracing::warn!(
                    "Company intel lookup for lead {} exceeded {:?}",
                    lead.id,
                    self.enrichment_timeout
                );
                self.score_rules(lead, None, true)
            }
        }
    }

    /// The pure rule set.
    pub fn score_rules(
        &self,
        lead: &Lead,
        profile: Option<&CompanyProfile>,
        provisional: bool,
    ) -> ScoreResult {
        let p = patterns();
        let mut total = 0;
        let mut factors = Vec::new();
        let mut highlights = Vec::new();
        let mut add = |points: i32, factor: String, factors: &mut Vec<String>| {
            total += points;
            factors.push(format!("{} (+{})", factor, points));
        };

        // Title
        let title = lead.title.as_deref().unwrap_or("").trim().to_lowercase();
        if !title.is_empty() {
            let (points, label) = if p.vp.is_match(&title) {
                (25, "VP-level title")
            } else if p.c_level.is_match(&title) {
                (30, "executive title")
            } else if p.director.is_match(&title) {
                (20, "director-level title")
            } else if p.manager.is_match(&title) {
                (12, "manager-level title")
            } else {
                (5, "title provided")
            };
            add(points, label.to_string(), &mut factors);
            if points >= 20 {
                highlights.push(label.to_string());
            }
        }

        // Company size, falling back to intel's estimate
        let employees = lead
            .employee_count
            .or_else(|| profile.and_then(|prof| prof.employee_count));
        if let Some(count) = employees {
            let points = match count {
                c if c >= 1000 => 25,
                c if c >= 200 => 20,
                c if c >= 50 => 15,
                c if c >= 10 => 8,
                c if c >= 1 => 3,
                _ => 0,
            };
            if points > 0 {
                add(points, format!("{} employees", count), &mut factors);
                if points >= 20 {
                    highlights.push(format!("{} employees", count));
                }
            }
        }

        // Inquiry language
        let message = lead.message.as_deref().unwrap_or("");
        let text = format!(
            "{} {}",
            message,
            lead.product_interest.as_deref().unwrap_or("")
        )
        .to_lowercase();
        if p.urgency.is_match(&text) {
            add(10, "urgency language".to_string(), &mut factors);
            highlights.push("urgent timeline".to_string());
        }
        if p.budget.is_match(&text) {
            add(10, "budget language".to_string(), &mut factors);
            highlights.push("budget discussed".to_string());
        }
        if p.multi.is_match(&text) {
            add(20, "multi-site or multi-seat intent".to_string(), &mut factors);
            highlights.push("multi-site intent".to_string());
        }
        if p.pain.is_match(&text) {
            add(10, "specific pain point".to_string(), &mut factors);
        }
        if message.trim().chars().count() >= DETAILED_MESSAGE_CHARS {
            add(5, "detailed inquiry".to_string(), &mut factors);
        }

        // Provenance
        let provenance = match lead.source {
            LeadSource::Referral => 10,
            LeadSource::Event | LeadSource::Partner => 8,
            LeadSource::WebsiteForm | LeadSource::Chat | LeadSource::Phone => 5,
            LeadSource::Email => 3,
            LeadSource::Social => 2,
        };
        add(provenance, format!("{} source", lead.source), &mut factors);

        if let Some(domain) = lead.email_domain() {
            if !FREE_MAILBOXES.contains(&domain) && !domain.ends_with(".edu") {
                add(5, "business email".to_string(), &mut factors);
            }
        }

        if let Some(industry) = lead.industry.as_deref().map(str::to_lowercase) {
            if self
                .target_industries
                .iter()
                .any(|target| industry == *target || industry.contains(target.as_str()))
            {
                add(10, format!("target industry ({})", industry), &mut factors);
                highlights.push(format!("{} industry", industry));
            }
        }

        if let Some(revenue) = profile.and_then(|prof| prof.estimated_revenue) {
            if revenue >= REVENUE_BONUS_THRESHOLD {
                add(5, "estimated revenue over $10M".to_string(), &mut factors);
            }
        }

        let mut score = total.clamp(0, 100);

        // Non-commercial signals
        let mut disqualifying = Vec::new();
        if p.student.is_match(&title) {
            disqualifying.push("student or intern title");
        }
        if PLACEHOLDER_COMPANIES.contains(&lead.company_key.as_str()) {
            disqualifying.push("placeholder company");
        }
        if p.non_commercial.is_match(&text) {
            disqualifying.push("academic or personal project");
        }
        let is_disqualifying = !disqualifying.is_empty();
        if is_disqualifying {
            score = score.min(NON_COMMERCIAL_CEILING);
            factors.push(format!(
                "non-commercial: {} (capped at {})",
                disqualifying.join(", "),
                NON_COMMERCIAL_CEILING
            ));
        }

        if provisional {
            factors.push("company intel unavailable (provisional)".to_string());
        }

        let qualified = score >= self.threshold && !is_disqualifying;
        let summary = summarize(lead, score, qualified, &highlights, &disqualifying);

        ScoreResult {
            score,
            factors,
            summary,
            qualified,
            provisional,
            disqualifying: is_disqualifying,
            timed_out: false,
        }
    }
}

fn summarize(
    lead: &Lead,
    score: i32,
    qualified: bool,
    highlights: &[String],
    disqualifying: &[&str],
) -> String {
    let who = match lead.title.as_deref() {
        Some(title) => format!("{} at {}", title, lead.company),
        None => lead.company.clone(),
    };
    let tier = ScoreTier::for_score(score).as_str();
    let mut summary = format!("{} scored {}/100 ({})", who, score, tier);
    if !highlights.is_empty() {
        summary.push_str(": ");
        summary.push_str(&highlights.join(", "));
    }
    summary.push('.');
    if !disqualifying.is_empty() {
        summary.push_str(&format!(
            " Likely non-commercial ({}).",
            disqualifying.join(", ")
        ));
    } else if qualified {
        summary.push_str(" Recommended for sales follow-up.");
    } else {
        summary.push_str(" Nurture until more buying signals appear.");
    }
    summary
}
