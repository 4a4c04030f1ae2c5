//! SLA-bound response dispatch.
//!
//! A dispatch runs in three phases so the per-lead lock is never held across
//! network I/O:
//! 1. under the lock, reserve the next attempt ordinal
//! 2. unlocked, generate content and send it (with transport retries)
//! 3. under the lock, record the outcome against a fresh read of the lead

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::content::{
    ContentIntelligence, ContentRequest, ContentVariant, TemplateContent, DEFAULT_AI_CONFIDENCE,
    TEMPLATE_CONFIDENCE, TEMPLATE_MODEL_ID,
};
use crate::errors::{AppError, ResultExt};
use crate::lifecycle;
use crate::locks::LeadLocks;
use crate::models::{AutoResponse, Lead, LeadSource, LeadStatus, ResponseChannel};
use crate::outbound::{OutboundMessage, OutboundSender};
use crate::scoring::ScoreTier;
use crate::store::LeadStore;

/// `hex(sha256("{lead_id}:{ordinal}"))`.
pub fn idempotency_key(lead_id: Uuid, ordinal: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", lead_id, ordinal).as_bytes());
    hex::encode(hasher.finalize())
}

/// Chat leads get a chat reply, phone leads with a number get SMS, everyone
/// else gets email.
pub fn response_channel(lead: &Lead) -> ResponseChannel {
    match lead.source {
        LeadSource::Chat => ResponseChannel::Chat,
        LeadSource::Phone if lead.phone.is_some() => ResponseChannel::Sms,
        _ => ResponseChannel::Email,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Accepted by the transport and recorded.
    Sent {
        response: AutoResponse,
        lead: Lead,
    },
    /// The idempotency key was already recorded; nothing new was written.
    AlreadyRecorded { idempotency_key: String },
    /// Every transport try failed; the lead is flagged for follow-up.
    Failed { error: String, lead: Lead },
}

/// Content chosen for a dispatch, AI or template.
struct Draft {
    variant: ContentVariant,
    model_id: String,
    confidence: f64,
    fallback_used: bool,
}

pub struct ResponseDispatcher {
    store: Arc<dyn LeadStore>,
    locks: LeadLocks,
    content: Arc<dyn ContentIntelligence>,
    sender: Arc<dyn OutboundSender>,
    templates: TemplateContent,
    response_sla: Duration,
    content_timeout: Duration,
    send_reserve: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl ResponseDispatcher {
    pub fn new(
        store: Arc<dyn LeadStore>,
        locks: LeadLocks,
        content: Arc<dyn ContentIntelligence>,
        sender: Arc<dyn OutboundSender>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            locks,
            content,
            sender,
            templates: TemplateContent,
            response_sla: settings.response_sla,
            content_timeout: settings.content_timeout,
            send_reserve: settings.send_reserve,
            max_attempts: settings.delivery_max_attempts.max(1),
            backoff: settings.delivery_backoff,
        }
    }

    pub async fn dispatch(&self, lead_id: Uuid) -> Result<DispatchOutcome, AppError> {
        let (lead, ordinal) = self.reserve_attempt(lead_id).await?;
        let key = idempotency_key(lead_id, ordinal);
        let channel = response_channel(&lead);

        let draft = self.draft(&lead, channel).await;
        let message = OutboundMessage {
            lead_id,
            channel,
            to: recipient(&lead, channel),
            subject: draft.variant.subject.clone(),
            body: draft.variant.body.clone(),
            idempotency_key: key.clone(),
        };

        match self.send_with_retries(&message).await {
            Ok(transport_attempts) => {
                self.record_success(lead_id, ordinal, &message, &draft, transport_attempts)
                    .await
            }
            Err(e) => self.record_failure(lead_id, &e).await,
        }
    }

    async fn reserve_attempt(&self, lead_id: Uuid) -> Result<(Lead, i32), AppError> {
        let _guard = self.locks.lock(lead_id).await;
        let mut lead = load(self.store.as_ref(), lead_id).await?;
        if lead.status.is_terminal() {
            return Err(AppError::InvalidTransition {
                from: lead.status,
                to: LeadStatus::AutoResponded,
                reason: format!("cannot respond to a {} lead", lead.status),
            });
        }
        lead.dispatch_attempts += 1;
        let ordinal = lead.dispatch_attempts;
        let lead = self
            .store
            .update_lead(&lead)
            .await
            .with_context(|| format!("reserving dispatch attempt for lead {}", lead_id))?;
        Ok((lead, ordinal))
    }

    /// Time Content Intelligence may take for this lead.
    ///
    /// First responses are bounded by what is left of the SLA after reserving
    /// time for the send; later (manual) responses only by the content timeout.
    fn content_budget(&self, lead: &Lead, now: DateTime<Utc>) -> Duration {
        if lead.response_sent {
            return self.content_timeout;
        }
        let deadline = lead.received_at
            + chrono::Duration::from_std(self.response_sla).unwrap_or(chrono::Duration::zero());
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        remaining
            .saturating_sub(self.send_reserve)
            .min(self.content_timeout)
    }

    async fn draft(&self, lead: &Lead, channel: ResponseChannel) -> Draft {
        let request = ContentRequest::speed_to_lead(lead, channel);
        let budget = self.content_budget(lead, Utc::now());

        if budget.is_zero() {
            tracing::warn!(
                "No SLA budget left for content on lead {}, using template",
                lead.id
            );
            return self.template_draft(&request);
        }

        match tokio::time::timeout(budget, self.content.generate(&request)).await {
            Ok(Ok(generated)) => match generated.variants.into_iter().next() {
                Some(variant) => {
                    let fallback_used = generated.model_id == TEMPLATE_MODEL_ID;
                    let confidence = variant.confidence.unwrap_or(if fallback_used {
                        TEMPLATE_CONFIDENCE
                    } else {
                        DEFAULT_AI_CONFIDENCE
                    });
                    Draft {
                        variant,
                        model_id: generated.model_id,
                        confidence,
                        fallback_used,
                    }
                }
                None => {
                    tracing::warn!("Content for lead {} had no variants", lead.id);
                    self.template_draft(&request)
                }
            },
            Ok(Err(e)) => {
                tracing::warn!("Content generation failed for lead {}: {}", lead.id, e);
                self.template_draft(&request)
            }
            Err(_) => {
                tracing::warn!(
                    "Content generation for lead {} exceeded {:?}, using template",
                    lead.id,
                    budget
                );
                self.template_draft(&request)
            }
        }
    }

    fn template_draft(&self, request: &ContentRequest) -> Draft {
        Draft {
            variant: self.templates.render(request),
            model_id: TEMPLATE_MODEL_ID.to_string(),
            confidence: TEMPLATE_CONFIDENCE,
            fallback_used: true,
        }
    }

    /// Returns how many tries the accepted send took.
    async fn send_with_retries(&self, message: &OutboundMessage) -> Result<i32, AppError> {
        let mut delay = self.backoff;
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.sender.send(message).await {
                Ok(receipt) => {
                    tracing::debug!(
                        "Lead {} delivered on try {} ({:?})",
                        message.lead_id,
                        attempt,
                        receipt.message_id
                    );
                    return Ok(attempt as i32);
                }
                Err(e) => {
                    tracing::warn!(
                        "Delivery try {}/{} for lead {} failed: {}",
                        attempt,
                        self.max_attempts,
                        message.lead_id,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::Delivery("no delivery attempted".to_string())))
    }

    async fn record_success(
        &self,
        lead_id: Uuid,
        ordinal: i32,
        message: &OutboundMessage,
        draft: &Draft,
        transport_attempts: i32,
    ) -> Result<DispatchOutcome, AppError> {
        let _guard = self.locks.lock(lead_id).await;
        let mut lead = load(self.store.as_ref(), lead_id).await?;
        let sent_at = Utc::now();

        let first = !lead.response_sent;
        let (response_time_ms, sla_met) = if first {
            let elapsed = (sent_at - lead.received_at).num_milliseconds().max(0);
            let sla_met = elapsed <= self.response_sla.as_millis() as i64;
            if !sla_met {
                tracing::warn!(
                    "Lead {} missed the {:?} response SLA ({} ms)",
                    lead_id,
                    self.response_sla,
                    elapsed
                );
            }
            lead.response_sent = true;
            lead.response_body = Some(message.body.clone());
            lead.response_channel = Some(message.channel);
            lead.response_sent_at = Some(sent_at);
            lead.response_time_ms = Some(elapsed);
            (Some(elapsed), Some(sla_met))
        } else {
            (None, None)
        };
        lead.needs_follow_up = false;
        lead.last_delivery_error = None;
        if !lifecycle::mark_auto_responded(&mut lead, sent_at)? {
            tracing::debug!(
                "Lead {} already {}, recording response without transition",
                lead_id,
                lead.status
            );
        }

        let response = AutoResponse {
            id: Uuid::new_v4(),
            lead_id,
            attempt: ordinal,
            idempotency_key: message.idempotency_key.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            channel: message.channel,
            personalization: json!({
                "first_name": lead.first_name,
                "company": lead.company,
                "title": lead.title,
                "product_interest": lead.product_interest,
                "tier": ScoreTier::for_score(lead.score.unwrap_or(0)),
                "points": draft.variant.personalization_points,
            }),
            sent_at,
            opened: false,
            replied: false,
            confidence: draft.confidence,
            model_id: draft.model_id.clone(),
            fallback_used: draft.fallback_used,
            transport_attempts,
            response_time_ms,
            sla_met,
        };

        match self.store.record_auto_response(&response, &lead).await? {
            Some(lead) => {
                tracing::info!(
                    "Auto-response {} recorded for lead {} (fallback: {}, {:?} ms)",
                    response.id,
                    lead_id,
                    response.fallback_used,
                    response.response_time_ms
                );
                Ok(DispatchOutcome::Sent { response, lead })
            }
            None => {
                tracing::warn!(
                    "Idempotency key {} already recorded for lead {}",
                    response.idempotency_key,
                    lead_id
                );
                Ok(DispatchOutcome::AlreadyRecorded {
                    idempotency_key: response.idempotency_key,
                })
            }
        }
    }

    async fn record_failure(&self, lead_id: Uuid, error: &AppError) -> Result<DispatchOutcome, AppError> {
        tracing::error!("Delivery failed for lead {}: {}", lead_id, error);
        let _guard = self.locks.lock(lead_id).await;
        let mut lead = load(self.store.as_ref(), lead_id).await?;
        lead.needs_follow_up = true;
        lead.last_delivery_error = Some(error.to_string());
        let lead = self.store.update_lead(&lead).await?;
        Ok(DispatchOutcome::Failed {
            error: error.to_string(),
            lead,
        })
    }
}

fn recipient(lead: &Lead, channel: ResponseChannel) -> String {
    match channel {
        ResponseChannel::Sms => lead.phone.clone().unwrap_or_else(|| lead.email.clone()),
        ResponseChannel::Email | ResponseChannel::Chat => lead.email.clone(),
    }
}

pub(crate) async fn load(store: &dyn LeadStore, lead_id: Uuid) -> Result<Lead, AppError> {
    store
        .get_lead(lead_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::GeneratedContent;
    use crate::outbound::DeliveryReceipt;
    use crate::store::MemoryLeadStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct BrokenContent;

    #[async_trait]
    impl ContentIntelligence for BrokenContent {
        async fn generate(&self, _: &ContentRequest) -> Result<GeneratedContent, AppError> {
            Err(AppError::ContentGeneration("model overloaded".into()))
        }
    }

    /// Fails the first `failures` sends, then accepts.
    struct FlakySender {
        failures: u32,
        calls: AtomicU32,
        keys: std::sync::Mutex<Vec<String>>,
    }

    impl FlakySender {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                keys: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OutboundSender for FlakySender {
        async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, AppError> {
            self.keys.lock().unwrap().push(message.idempotency_key.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(AppError::Delivery("relay 503".into()))
            } else {
                Ok(DeliveryReceipt::default())
            }
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            delivery_backoff: Duration::from_millis(1),
            ..EngineSettings::default()
        }
    }

    async fn seeded(store: &MemoryLeadStore, source: LeadSource) -> Lead {
        let mut lead = Lead::new(
            source,
            "dana@acme.io".into(),
            "Acme".into(),
            "acme".into(),
            Utc::now(),
        );
        lead.score = Some(72);
        store.insert_lead(&lead).await.unwrap();
        lead
    }

    fn dispatcher(
        store: Arc<MemoryLeadStore>,
        content: Arc<dyn ContentIntelligence>,
        sender: Arc<dyn OutboundSender>,
    ) -> ResponseDispatcher {
        ResponseDispatcher::new(store, LeadLocks::default(), content, sender, &settings())
    }

    #[test]
    fn test_idempotency_key_is_stable_per_ordinal() {
        let id = Uuid::new_v4();
        assert_eq!(idempotency_key(id, 1), idempotency_key(id, 1));
        assert_ne!(idempotency_key(id, 1), idempotency_key(id, 2));
        assert_eq!(idempotency_key(id, 1).len(), 64);
    }

    #[test]
    fn test_channel_selection() {
        let mut lead = Lead::new(
            LeadSource::Phone,
            "a@acme.io".into(),
            "Acme".into(),
            "acme".into(),
            Utc::now(),
        );
        assert_eq!(response_channel(&lead), ResponseChannel::Email);
        lead.phone = Some("+16502530000".into());
        assert_eq!(response_channel(&lead), ResponseChannel::Sms);
        lead.source = LeadSource::Chat;
        assert_eq!(response_channel(&lead), ResponseChannel::Chat);
    }

    #[test]
    fn test_content_budget_leaves_send_reserve() {
        let store = Arc::new(MemoryLeadStore::new());
        let d = dispatcher(store, Arc::new(TemplateContent), Arc::new(FlakySender::new(0)));
        let now = Utc::now();
        let mut lead = Lead::new(
            LeadSource::Email,
            "a@acme.io".into(),
            "Acme".into(),
            "acme".into(),
            now - chrono::Duration::seconds(10),
        );
        // 30s SLA - 10s elapsed - 5s reserve
        assert_eq!(d.content_budget(&lead, now), Duration::from_secs(15));

        lead.received_at = now - chrono::Duration::seconds(40);
        assert_eq!(d.content_budget(&lead, now), Duration::ZERO);

        lead.response_sent = true;
        assert_eq!(d.content_budget(&lead, now), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_fallback_on_content_failure() {
        let store = Arc::new(MemoryLeadStore::new());
        let lead = seeded(&store, LeadSource::WebsiteForm).await;
        let d = dispatcher(store.clone(), Arc::new(BrokenContent), Arc::new(FlakySender::new(0)));

        let outcome = d.dispatch(lead.id).await.unwrap();
        let DispatchOutcome::Sent { response, lead } = outcome else {
            panic!("expected a sent response");
        };
        assert!(response.fallback_used);
        assert_eq!(response.model_id, TEMPLATE_MODEL_ID);
        assert_eq!(response.sla_met, Some(true));
        assert_eq!(lead.status, LeadStatus::AutoResponded);
        assert_eq!(lead.response_time_ms, response.response_time_ms);
    }

    #[tokio::test]
    async fn test_retries_reuse_idempotency_key() {
        let store = Arc::new(MemoryLeadStore::new());
        let lead = seeded(&store, LeadSource::Email).await;
        let sender = Arc::new(FlakySender::new(2));
        let d = dispatcher(store.clone(), Arc::new(TemplateContent), sender.clone());

        let outcome = d.dispatch(lead.id).await.unwrap();
        let DispatchOutcome::Sent { response, .. } = outcome else {
            panic!("expected a sent response");
        };
        assert_eq!(response.transport_attempts, 3);
        let keys = sender.keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| *k == keys[0]));
        assert_eq!(store.auto_responses(lead.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_flags_follow_up() {
        let store = Arc::new(MemoryLeadStore::new());
        let lead = seeded(&store, LeadSource::Email).await;
        let d = dispatcher(store.clone(), Arc::new(TemplateContent), Arc::new(FlakySender::new(10)));

        let outcome = d.dispatch(lead.id).await.unwrap();
        let DispatchOutcome::Failed { lead, .. } = outcome else {
            panic!("expected a failed dispatch");
        };
        assert!(lead.needs_follow_up);
        assert!(lead.last_delivery_error.is_some());
        assert_eq!(lead.status, LeadStatus::New);
        assert!(store.auto_responses(lead.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_response_keeps_first_timing() {
        let store = Arc::new(MemoryLeadStore::new());
        let lead = seeded(&store, LeadSource::Email).await;
        let d = dispatcher(store.clone(), Arc::new(TemplateContent), Arc::new(FlakySender::new(0)));

        d.dispatch(lead.id).await.unwrap();
        let first = store.get_lead(lead.id).await.unwrap().unwrap();
        d.dispatch(lead.id).await.unwrap();
        let second = store.get_lead(lead.id).await.unwrap().unwrap();

        assert_eq!(first.response_time_ms, second.response_time_ms);
        assert_eq!(first.response_sent_at, second.response_sent_at);
        let responses = store.auto_responses(lead.id).await.unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].response_time_ms.is_some());
        assert!(responses[1].response_time_ms.is_none());
        assert_ne!(responses[0].idempotency_key, responses[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_response_after_review_skips_transition() {
        let store = Arc::new(MemoryLeadStore::new());
        let mut lead = seeded(&store, LeadSource::Email).await;
        lead.status = LeadStatus::SdrReview;
        store.update_lead(&lead).await.unwrap();
        let d = dispatcher(store.clone(), Arc::new(TemplateContent), Arc::new(FlakySender::new(0)));

        let DispatchOutcome::Sent { lead, .. } = d.dispatch(lead.id).await.unwrap() else {
            panic!("expected a sent response");
        };
        assert_eq!(lead.status, LeadStatus::SdrReview);
        assert!(lead.response_sent);
    }
}
