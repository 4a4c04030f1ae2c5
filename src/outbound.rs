use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::circuit_breaker::{create_service_circuit_breaker, guarded, ServiceBreaker};
use crate::errors::AppError;
use crate::models::ResponseChannel;

/// One message handed to the delivery transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub lead_id: Uuid,
    pub channel: ResponseChannel,
    /// Email address, E.164 number or chat handle, depending on `channel`.
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Stable across transport retries of the same dispatch.
    #[serde(skip)]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub message_id: Option<String>,
}

#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, AppError>;
}

/// Client for the outbound delivery relay.
///
/// The relay fans messages out to the email, SMS and chat providers and
/// deduplicates on the `Idempotency-Key` header.
#[derive(Clone)]
pub struct HttpOutboundSender {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    breaker: ServiceBreaker,
}

impl HttpOutboundSender {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create relay client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            token,
            breaker: create_service_circuit_breaker(),
        })
    }

    async fn post_message(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, AppError> {
        let url = format!("{}/messages", self.base_url);
        tracing::info!(
            "Sending {} response for lead {} via relay",
            message.channel,
            message.lead_id
        );

        let mut request = self
            .client
            .post(&url)
            .header("Idempotency-Key", &message.idempotency_key)
            .json(message);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("Relay request failed: {}", e)))?;

        // 409 means the relay already accepted this idempotency key.
        if response.status() == reqwest::StatusCode::CONFLICT {
            tracing::info!(
                "Relay already accepted message for lead {}",
                message.lead_id
            );
            return Ok(DeliveryReceipt::default());
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Delivery(format!(
                "Relay returned {}: {}",
                status, error_text
            )));
        }

        let receipt = response.json().await.unwrap_or_default();
        tracing::info!("✓ Response delivered for lead {}", message.lead_id);
        Ok(receipt)
    }
}

#[async_trait]
impl OutboundSender for HttpOutboundSender {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, AppError> {
        guarded(&self.breaker, "outbound relay", self.post_message(message))
            .await
            .map_err(|e| match e {
                AppError::Delivery(_) => e,
                other => AppError::Delivery(other.to_string()),
            })
    }
}

/// Dry-run transport used when no relay is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSender;

#[async_trait]
impl OutboundSender for LoggingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, AppError> {
        tracing::info!(
            "[dry-run] {} to {} for lead {}: {}",
            message.channel,
            message.to,
            message.lead_id,
            message.subject
        );
        Ok(DeliveryReceipt {
            message_id: Some(format!("dry-run-{}", message.idempotency_key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let sender = HttpOutboundSender::new("https://relay.example.com".to_string(), None);
        assert!(sender.is_ok());
    }

    #[tokio::test]
    async fn test_logging_sender_always_accepts() {
        let message = OutboundMessage {
            lead_id: Uuid::new_v4(),
            channel: ResponseChannel::Email,
            to: "dana@acme.io".to_string(),
            subject: "Hello".to_string(),
            body: "Hi".to_string(),
            idempotency_key: "abc".to_string(),
        };
        let receipt = LoggingSender.send(&message).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("dry-run-abc"));
    }
}
