use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::IntakeResponse;

/// Channel webhook body - can be single object or array
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WebhookPayload {
    Batch(Vec<ChannelEvent>),
    Single(ChannelEvent),
}

impl WebhookPayload {
    /// Convert to a vec of events for uniform processing
    pub fn into_events(self) -> Vec<ChannelEvent> {
        match self {
            WebhookPayload::Single(event) => vec![event],
            WebhookPayload::Batch(events) => events,
        }
    }
}

/// One inbound event from a channel integration.
///
/// Providers either wrap the submission (`{"id", "event", "payload": {...}}`)
/// or post the submission fields directly at the top level.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelEvent {
    /// Provider event id, used to drop redeliveries.
    #[serde(default)]
    pub id: Option<String>,

    /// Event type (e.g., "form.submitted", "chat.started")
    #[serde(default, alias = "type", alias = "hook_action")]
    pub event: Option<String>,

    /// Wrapped submission
    #[serde(default, alias = "data")]
    pub payload: Option<Value>,

    /// Everything else
    #[serde(flatten)]
    pub raw: Map<String, Value>,
}

impl ChannelEvent {
    /// The submission to hand to intake.
    pub fn submission(&self) -> Value {
        match &self.payload {
            Some(payload) => payload.clone(),
            None => Value::Object(self.raw.clone()),
        }
    }
}

/// Response returned to webhook callers
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: String,
    pub received: usize,
    pub created: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub leads: Vec<IntakeResponse>,
}
