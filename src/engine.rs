//! Orchestration of the lead pipeline.
//!
//! `LeadEngine` owns one instance of every component and is the only thing
//! the HTTP layer talks to. All per-lead writes go through the shared
//! `LeadLocks` so intake merges, scoring, dispatch, reviewer commands and
//! conversion never interleave on the same lead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::content::ContentIntelligence;
use crate::conversion::ConversionService;
use crate::dispatcher::{load, DispatchOutcome, ResponseDispatcher};
use crate::errors::{AppError, ResultExt};
use crate::intake::{IntakeNormalizer, IntakeOutcome};
use crate::lifecycle;
use crate::locks::LeadLocks;
use crate::metrics::{MetricsAggregator, PipelineMetrics};
use crate::models::{
    Actor, ConversionResult, IntakeResponse, Lead, LeadDetail, LeadPage, LeadQuery, LeadSource,
    ScoreTrigger,
};
use crate::outbound::OutboundSender;
use crate::scoring::{apply_score, ScoreResult, ScoringEngine};
use crate::services::CompanyIntel;
use crate::store::LeadStore;

/// External capabilities the engine depends on.
pub struct Collaborators {
    pub intel: Option<Arc<dyn CompanyIntel>>,
    pub content: Arc<dyn ContentIntelligence>,
    pub sender: Arc<dyn OutboundSender>,
}

/// A scoring run and whether it was written to the lead.
#[derive(Debug, Clone)]
pub struct ScoredLead {
    pub lead: Lead,
    pub result: ScoreResult,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub lead: Lead,
    pub score: ScoreResult,
    pub dispatch: DispatchOutcome,
    pub auto_disqualified: bool,
}

pub struct LeadEngine {
    store: Arc<dyn LeadStore>,
    locks: LeadLocks,
    settings: EngineSettings,
    intake: IntakeNormalizer,
    scoring: ScoringEngine,
    dispatcher: ResponseDispatcher,
    conversion: ConversionService,
    metrics: MetricsAggregator,
}

impl LeadEngine {
    pub fn new(
        store: Arc<dyn LeadStore>,
        settings: EngineSettings,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let locks = LeadLocks::default();
        Arc::new(Self {
            intake: IntakeNormalizer::new(store.clone(), locks.clone(), &settings),
            scoring: ScoringEngine::new(&settings, collaborators.intel),
            dispatcher: ResponseDispatcher::new(
                store.clone(),
                locks.clone(),
                collaborators.content,
                collaborators.sender,
                &settings,
            ),
            conversion: ConversionService::new(
                store.clone(),
                locks.clone(),
                settings.seat_price.clone(),
            ),
            metrics: MetricsAggregator::new(settings.response_sla),
            store,
            locks,
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ============ Intake ============

    /// Normalizes and persists one submission without running the pipeline.
    pub async fn ingest(&self, source: LeadSource, payload: &Value) -> Result<IntakeOutcome, AppError> {
        self.intake.ingest(source, payload).await
    }

    /// Intake entry point used by the API: persists the lead, answers
    /// immediately and runs scoring plus dispatch in the background.
    ///
    /// A duplicate gets a background re-score so the merged message counts.
    pub async fn submit(
        self: &Arc<Self>,
        source: LeadSource,
        payload: &Value,
    ) -> Result<IntakeResponse, AppError> {
        let outcome = self.ingest(source, payload).await?;
        let lead = outcome.lead();
        let response = IntakeResponse {
            lead_id: lead.id,
            status: lead.status,
            duplicate: outcome.is_duplicate(),
        };

        let engine = Arc::clone(self);
        let lead_id = lead.id;
        match outcome {
            IntakeOutcome::Created(_) => {
                tokio::spawn(async move {
                    if let Err(e) = engine.run_pipeline(lead_id).await {
                        tracing::error!("Pipeline failed for lead {}: {}", lead_id, e);
                    }
                });
            }
            IntakeOutcome::Duplicate(_) => {
                tokio::spawn(async move {
                    match engine.score_lead(lead_id, ScoreTrigger::Intake).await {
                        Ok(scored) if scored.applied && scored.result.provisional => {
                            engine.schedule_retry(lead_id);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Re-score after merge failed for lead {}: {}", lead_id, e);
                        }
                    }
                });
            }
        }
        Ok(response)
    }

    /// Score, then respond, then apply automatic rules.
    pub async fn run_pipeline(self: &Arc<Self>, lead_id: Uuid) -> Result<PipelineReport, AppError> {
        let scored = self.score_lead(lead_id, ScoreTrigger::Intake).await?;
        if scored.applied && scored.result.provisional {
            self.schedule_retry(lead_id);
        }

        // Courtesy responses go out regardless of the score.
        let dispatch = self.dispatcher.dispatch(lead_id).await?;

        let mut auto_disqualified = false;
        if scored.result.disqualifying && self.settings.auto_disqualify_non_commercial {
            let notes = format!(
                "Automatically disqualified: {}",
                scored.result.factors.join(", ")
            );
            match self
                .mutate(lead_id, |lead, at| {
                    lifecycle::disqualify(lead, &notes, Actor::Rule, at)
                })
                .await
            {
                Ok(_) => {
                    tracing::info!("Lead {} disqualified by non-commercial rule", lead_id);
                    auto_disqualified = true;
                }
                Err(e) => tracing::warn!("Non-commercial rule skipped for lead {}: {}", lead_id, e),
            }
        }

        let lead = load(self.store.as_ref(), lead_id).await?;
        Ok(PipelineReport {
            lead,
            score: scored.result,
            dispatch,
            auto_disqualified,
        })
    }

    // ============ Scoring ============

    /// Scores against a snapshot, then applies the result to a fresh read
    /// under the lead lock.
    ///
    /// A final score is never replaced implicitly: retries leave it alone, and
    /// so does any provisional result that is not a manual re-score.
    pub async fn score_lead(&self, lead_id: Uuid, trigger: ScoreTrigger) -> Result<ScoredLead, AppError> {
        let snapshot = load(self.store.as_ref(), lead_id).await?;
        let result = self.scoring.score(&snapshot).await;

        let _guard = self.locks.lock(lead_id).await;
        let mut lead = load(self.store.as_ref(), lead_id).await?;
        let has_final = lead.is_scored() && !lead.score_provisional;
        let keeps_final = match trigger {
            ScoreTrigger::Retry => has_final,
            ScoreTrigger::Intake => has_final && result.provisional,
            ScoreTrigger::Manual => false,
        };
        if keeps_final {
            tracing::debug!(
                "Lead {} already has a final score, {:?} result discarded",
                lead_id,
                trigger
            );
            return Ok(ScoredLead {
                lead,
                result,
                applied: false,
            });
        }

        apply_score(&mut lead, &result, trigger, Utc::now());
        let lead = self
            .store
            .update_lead(&lead)
            .await
            .with_context(|| format!("writing score for lead {}", lead_id))?;
        tracing::info!(
            "Lead {} scored {} ({}{})",
            lead_id,
            result.score,
            result.tier().as_str(),
            if result.provisional { ", provisional" } else { "" }
        );
        Ok(ScoredLead {
            lead,
            result,
            applied: true,
        })
    }

    /// Bounded background re-scoring of a provisional score.
    pub fn schedule_retry(self: &Arc<Self>, lead_id: Uuid) {
        let engine = Arc::clone(self);
        let attempts = self.settings.scoring_retry_attempts;
        let mut delay = self.settings.scoring_retry_backoff;
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                match engine.score_lead(lead_id, ScoreTrigger::Retry).await {
                    Ok(scored) if !scored.applied || !scored.result.provisional => {
                        tracing::debug!("Scoring retry for lead {} settled on try {}", lead_id, attempt);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Scoring retry {} for lead {} failed: {}", attempt, lead_id, e);
                    }
                }
            }
            tracing::warn!(
                "Lead {} still provisional after {} scoring retries",
                lead_id,
                attempts
            );
        });
    }

    /// Manual re-score. A timed-out run leaves the stored score alone.
    pub async fn rescore(&self, lead_id: Uuid) -> Result<Lead, AppError> {
        let snapshot = load(self.store.as_ref(), lead_id).await?;
        let result = self.scoring.score(&snapshot).await;
        if result.timed_out {
            return Err(AppError::ScoringTimeout);
        }

        let _guard = self.locks.lock(lead_id).await;
        let mut lead = load(self.store.as_ref(), lead_id).await?;
        apply_score(&mut lead, &result, ScoreTrigger::Manual, Utc::now());
        self.store.update_lead(&lead).await
    }

    // ============ Reviewer commands ============

    pub async fn claim(&self, lead_id: Uuid, sdr_id: &str) -> Result<Lead, AppError> {
        let lead = self
            .mutate(lead_id, |lead, at| lifecycle::claim(lead, sdr_id, at))
            .await?;
        tracing::info!("Lead {} claimed by {}", lead_id, sdr_id);
        Ok(lead)
    }

    pub async fn qualify(&self, lead_id: Uuid, notes: &str, ae_id: Option<&str>) -> Result<Lead, AppError> {
        let lead = self
            .mutate(lead_id, |lead, at| {
                lifecycle::qualify(lead, notes, ae_id, Actor::Reviewer, at)
            })
            .await?;
        tracing::info!("Lead {} qualified", lead_id);
        Ok(lead)
    }

    pub async fn disqualify(&self, lead_id: Uuid, notes: &str) -> Result<Lead, AppError> {
        let lead = self
            .mutate(lead_id, |lead, at| {
                lifecycle::disqualify(lead, notes, Actor::Reviewer, at)
            })
            .await?;
        tracing::info!("Lead {} disqualified", lead_id);
        Ok(lead)
    }

    pub async fn convert(&self, lead_id: Uuid) -> Result<ConversionResult, AppError> {
        self.conversion.convert(lead_id).await
    }

    /// Manual (re-)dispatch; uses the next attempt ordinal.
    pub async fn respond(&self, lead_id: Uuid) -> Result<DispatchOutcome, AppError> {
        self.dispatcher.dispatch(lead_id).await
    }

    // ============ Reads ============

    pub async fn list(&self, query: &LeadQuery) -> Result<LeadPage, AppError> {
        self.store.list_leads(query).await
    }

    pub async fn detail(&self, lead_id: Uuid) -> Result<LeadDetail, AppError> {
        let lead = load(self.store.as_ref(), lead_id).await?;
        let auto_responses = self.store.auto_responses(lead_id).await?;
        let score_state = lead.score.map(|_| {
            if lead.score_provisional {
                "provisional"
            } else {
                "final"
            }
        });
        Ok(LeadDetail {
            allowed_actions: lifecycle::allowed_actions(&lead),
            lead,
            auto_responses,
            score_state,
        })
    }

    pub async fn metrics(&self) -> Result<PipelineMetrics, AppError> {
        self.metrics.collect(&self.store, Utc::now()).await
    }

    /// Lock, read fresh, apply `change`, write. Nothing is written when
    /// `change` fails.
    async fn mutate<F>(&self, lead_id: Uuid, change: F) -> Result<Lead, AppError>
    where
        F: FnOnce(&mut Lead, DateTime<Utc>) -> Result<(), AppError>,
    {
        let _guard = self.locks.lock(lead_id).await;
        let mut lead = load(self.store.as_ref(), lead_id).await?;
        change(&mut lead, Utc::now())?;
        self.store.update_lead(&lead).await
    }
}

/// Polls `lead_id` until `done` holds or `timeout` elapses. Used by callers
/// that need to observe the background pipeline.
pub async fn wait_for<F>(
    store: &dyn LeadStore,
    lead_id: Uuid,
    timeout: Duration,
    done: F,
) -> Result<Lead, AppError>
where
    F: Fn(&Lead) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let lead = load(store, lead_id).await?;
        if done(&lead) || tokio::time::Instant::now() >= deadline {
            return Ok(lead);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::TemplateContent;
    use crate::models::LeadStatus;
    use crate::outbound::LoggingSender;
    use crate::services::CompanyProfile;
    use crate::store::MemoryLeadStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Intel that can be switched into stalling past any scoring timeout.
    struct StallableIntel {
        stalled: AtomicBool,
    }

    #[async_trait]
    impl CompanyIntel for StallableIntel {
        async fn lookup(&self, _: &str, _: Option<&str>) -> Result<CompanyProfile, AppError> {
            if self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(CompanyProfile {
                estimated_revenue: Some(50_000_000.0),
                ..CompanyProfile::default()
            })
        }
    }

    /// Intel that is unavailable for the first `failures` lookups.
    struct RecoveringIntel {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompanyIntel for RecoveringIntel {
        async fn lookup(&self, _: &str, _: Option<&str>) -> Result<CompanyProfile, AppError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(AppError::EnrichmentUnavailable("intel down".to_string()));
            }
            Ok(CompanyProfile::default())
        }
    }

    fn engine_with_intel(
        settings: EngineSettings,
        intel: Arc<dyn CompanyIntel>,
    ) -> (Arc<LeadEngine>, Arc<MemoryLeadStore>) {
        let store = Arc::new(MemoryLeadStore::new());
        let engine = LeadEngine::new(
            store.clone(),
            settings,
            Collaborators {
                intel: Some(intel),
                content: Arc::new(TemplateContent),
                sender: Arc::new(LoggingSender),
            },
        );
        (engine, store)
    }

    fn vp_payload() -> Value {
        json!({
            "email": "jordan@northwind.com",
            "company": "Northwind Logistics",
            "title": "VP Operations",
            "employees": "500",
            "message": "We need one dispatch system across 14 warehouses, budget approved this quarter."
        })
    }

    fn engine_with(settings: EngineSettings) -> (Arc<LeadEngine>, Arc<MemoryLeadStore>) {
        let store = Arc::new(MemoryLeadStore::new());
        let engine = LeadEngine::new(
            store.clone(),
            settings,
            Collaborators {
                intel: None,
                content: Arc::new(TemplateContent),
                sender: Arc::new(LoggingSender),
            },
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_pipeline_scores_and_responds() {
        let (engine, _) = engine_with(EngineSettings::default());
        let outcome = engine
            .ingest(
                LeadSource::WebsiteForm,
                &json!({"email": "dana@acme.io", "company": "Acme", "title": "Director of Ops"}),
            )
            .await
            .unwrap();

        let report = engine.run_pipeline(outcome.lead().id).await.unwrap();
        assert!(report.lead.is_scored());
        assert_eq!(report.lead.status, LeadStatus::AutoResponded);
        assert!(matches!(report.dispatch, DispatchOutcome::Sent { .. }));
        assert!(!report.auto_disqualified);
    }

    #[tokio::test]
    async fn test_non_commercial_rule_disqualifies_after_response() {
        let settings = EngineSettings {
            auto_disqualify_non_commercial: true,
            ..EngineSettings::default()
        };
        let (engine, store) = engine_with(settings);
        let outcome = engine
            .ingest(
                LeadSource::WebsiteForm,
                &json!({
                    "email": "sam@gmail.com",
                    "company": "University",
                    "title": "Graduate Student",
                    "message": "Researching dispatch tools for my thesis."
                }),
            )
            .await
            .unwrap();

        let report = engine.run_pipeline(outcome.lead().id).await.unwrap();
        assert!(report.auto_disqualified);
        assert_eq!(report.lead.status, LeadStatus::Disqualified);
        assert_eq!(
            report.lead.status_history.last().map(|c| c.actor),
            Some(Actor::Rule)
        );
        assert_eq!(store.auto_responses(report.lead.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_command_leaves_lead_untouched() {
        let (engine, store) = engine_with(EngineSettings::default());
        let outcome = engine
            .ingest(
                LeadSource::Email,
                &json!({"email": "dana@acme.io", "company": "Acme"}),
            )
            .await
            .unwrap();
        let id = outcome.lead().id;

        let err = engine.qualify(id, "   ", None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let stored = store.get_lead(id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::New);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_detail_reports_score_state_and_actions() {
        let (engine, _) = engine_with(EngineSettings::default());
        let outcome = engine
            .ingest(
                LeadSource::Chat,
                &json!({"email": "dana@acme.io", "company": "Acme"}),
            )
            .await
            .unwrap();
        let id = outcome.lead().id;

        let detail = engine.detail(id).await.unwrap();
        assert_eq!(detail.score_state, None);
        assert!(detail.allowed_actions.claim);
        assert!(!detail.allowed_actions.convert);

        engine.rescore(id).await.unwrap();
        let detail = engine.detail(id).await.unwrap();
        assert_eq!(detail.score_state, Some("final"));
    }
    #[tokio::test]
    async fn test_duplicate_rescore_keeps_final_score_when_intel_stalls() {
        let intel = Arc::new(StallableIntel {
            stalled: AtomicBool::new(false),
        });
        let settings = EngineSettings {
            scoring_timeout: Duration::from_millis(50),
            ..EngineSettings::default()
        };
        let (engine, store) = engine_with_intel(settings, intel.clone());
        let outcome = engine.ingest(LeadSource::WebsiteForm, &vp_payload()).await.unwrap();
        let id = outcome.lead().id;

        let scored = engine.score_lead(id, ScoreTrigger::Intake).await.unwrap();
        assert!(scored.applied);
        assert!(!scored.result.provisional);
        let before = store.get_lead(id).await.unwrap().unwrap();
        assert!(before.qualified_by_ai);

        intel.stalled.store(true, Ordering::SeqCst);
        let direct = engine.score_lead(id, ScoreTrigger::Intake).await.unwrap();
        assert!(!direct.applied);
        assert!(direct.result.timed_out);

        let response = engine.submit(LeadSource::Chat, &vp_payload()).await.unwrap();
        assert!(response.duplicate);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let after = store.get_lead(id).await.unwrap().unwrap();
        assert_eq!(after.score, before.score);
        assert_eq!(after.score_factors, before.score_factors);
        assert!(!after.score_provisional);
        assert!(after.qualified_by_ai);
        assert_eq!(after.score_history.len(), 1);
    }

    #[tokio::test]
    async fn test_provisional_duplicate_rescore_is_retried() {
        // Fails the first score and the re-score after the merge.
        let intel = Arc::new(RecoveringIntel {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let settings = EngineSettings {
            scoring_retry_backoff: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let (engine, store) = engine_with_intel(settings, intel);
        let outcome = engine.ingest(LeadSource::WebsiteForm, &vp_payload()).await.unwrap();
        let id = outcome.lead().id;

        let first = engine.score_lead(id, ScoreTrigger::Intake).await.unwrap();
        assert!(first.result.provisional);

        let response = engine.submit(LeadSource::Chat, &vp_payload()).await.unwrap();
        assert!(response.duplicate);

        let lead = wait_for(store.as_ref(), id, Duration::from_secs(3), |l| {
            l.is_scored() && !l.score_provisional
        })
        .await
        .unwrap();
        assert!(!lead.score_provisional);
    }
}
