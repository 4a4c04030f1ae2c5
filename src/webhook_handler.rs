use crate::errors::AppError;
use crate::handlers::{parse_channel, AppState};
use crate::webhook_models::{WebhookPayload, WebhookResponse};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Remembers provider event ids so redelivered events are dropped.
#[derive(Clone)]
pub struct EventDeduper {
    seen: Cache<String, ()>,
}

impl EventDeduper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(100_000)
                .build(),
        }
    }

    /// True the first time `id` is offered within the TTL.
    pub async fn first_sighting(&self, id: &str) -> bool {
        self.seen.entry(id.to_string()).or_insert(()).await.is_fresh()
    }

    /// Releases `id` so a redelivery of a failed event is processed again.
    pub async fn forget(&self, id: &str) {
        self.seen.invalidate(id).await;
    }
}

impl Default for EventDeduper {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

/// Channel Webhook Handler
///
/// Receives lead events from a channel integration (form provider, chat
/// widget, email parser). Validates the webhook secret and runs every event
/// through intake; one bad event does not fail the batch.
///
/// Expected payload: Single event object OR array of events
/// Authentication: X-Webhook-Token header must match WEBHOOK_SECRET env var
pub async fn channel_webhook(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    tracing::info!("Received {} webhook", channel);

    // 1. Validate webhook secret (if configured)
    validate_webhook_secret(state.config.webhook_secret.as_deref(), &headers)?;
    let source = parse_channel(&channel)?;

    // 2. Convert payload to vec of events (handles both single and batch)
    let events = payload.into_events();
    let received = events.len();
    tracing::info!("Processing {} webhook event(s)", received);

    let mut created = 0;
    let mut duplicates = 0;
    let mut rejected = 0;
    let mut leads = Vec::with_capacity(received);

    // 3. Process each event
    for event in events {
        if let Some(ref id) = event.id {
            if !state.webhook_events.first_sighting(id).await {
                duplicates += 1;
                tracing::debug!("Skipped redelivered webhook event {}", id);
                continue;
            }
        }

        match state.engine.submit(source, &event.submission()).await {
            Ok(response) => {
                if response.duplicate {
                    duplicates += 1;
                } else {
                    created += 1;
                }
                leads.push(response);
            }
            Err(e) => {
                rejected += 1;
                if let Some(ref id) = event.id {
                    state.webhook_events.forget(id).await;
                }
                match e.root() {
                    AppError::Validation(_) | AppError::RateLimited(_) => {
                        tracing::warn!("Rejected {} webhook event: {}", source, e)
                    }
                    _ => tracing::error!("Failed to process {} webhook event: {}", source, e),
                }
                // Continue processing other events even if one fails
            }
        }
    }

    tracing::info!(
        "Webhook processing complete: {} received, {} created, {} duplicates, {} rejected",
        received,
        created,
        duplicates,
        rejected
    );

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            status: "received".to_string(),
            received,
            created,
            duplicates,
            rejected,
            leads,
        }),
    ))
}

/// Validate webhook secret from X-Webhook-Token header
fn validate_webhook_secret(expected: Option<&str>, headers: &HeaderMap) -> Result<(), AppError> {
    // No secret configured: open endpoint (warned about at startup)
    let Some(expected_secret) = expected else {
        return Ok(());
    };

    let token = headers
        .get("X-Webhook-Token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
