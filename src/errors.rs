use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use uuid::Uuid;

use crate::models::LeadStatus;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad input from a channel or API caller. Never retried.
    Validation(String),
    /// The same source/email pair submitted too often.
    RateLimited(String),
    /// Company-intel lookup failed; scoring degrades to rules only.
    EnrichmentUnavailable(String),
    /// Scoring exceeded its bounded wait.
    ScoringTimeout,
    /// Content Intelligence failed; dispatcher falls back to templates.
    ContentGeneration(String),
    /// Outbound channel rejected the send.
    Delivery(String),
    /// Status change not present in the transition table.
    InvalidTransition {
        from: LeadStatus,
        to: LeadStatus,
        reason: String,
    },
    /// Conversion already happened; carries the existing links.
    AlreadyConverted { account_id: Uuid, deal_id: Uuid },
    /// Conversion rolled back; the lead stays qualified and retryable.
    Conversion(String),
    /// Optimistic version check failed on a lead write.
    Conflict(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// Unauthorized access error.
    Unauthorized(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Walks through `WithContext` wrappers to the underlying error.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            AppError::EnrichmentUnavailable(msg) => write!(f, "Enrichment unavailable: {}", msg),
            AppError::ScoringTimeout => write!(f, "Scoring timed out"),
            AppError::ContentGeneration(msg) => write!(f, "Content generation error: {}", msg),
            AppError::Delivery(msg) => write!(f, "Delivery error: {}", msg),
            AppError::InvalidTransition { from, to, reason } => {
                write!(f, "Invalid transition {} -> {}: {}", from, to, reason)
            }
            AppError::AlreadyConverted {
                account_id,
                deal_id,
            } => write!(
                f,
                "Lead already converted (account {}, deal {})",
                account_id, deal_id
            ),
            AppError::Conversion(msg) => write!(f, "Conversion error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    ///
    /// Infrastructure failures are logged here and masked in the body; domain
    /// failures (validation, transitions, conversion) are returned verbatim so
    /// the caller can see them.
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Database error" }),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg, "kind": "validation" }),
            ),
            AppError::RateLimited(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": msg, "kind": "rate_limited" }),
            ),
            AppError::EnrichmentUnavailable(msg)
            | AppError::ContentGeneration(msg)
            | AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "error": "External service error" }),
                )
            }
            AppError::ScoringTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": "Scoring timed out", "kind": "scoring_timeout" }),
            ),
            AppError::Delivery(msg) => {
                tracing::warn!("Delivery error surfaced to caller: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "error": msg, "kind": "delivery" }),
                )
            }
            AppError::InvalidTransition { from, to, reason } => (
                StatusCode::CONFLICT,
                json!({
                    "error": reason,
                    "kind": "invalid_transition",
                    "from": from,
                    "to": to,
                }),
            ),
            AppError::AlreadyConverted {
                account_id,
                deal_id,
            } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "Lead already converted",
                    "kind": "already_converted",
                    "account_id": account_id,
                    "deal_id": deal_id,
                }),
            ),
            AppError::Conversion(msg) => {
                tracing::error!("Conversion rolled back: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": msg, "kind": "conversion", "retryable": true }),
                )
            }
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                json!({ "error": msg, "kind": "conflict", "retryable": true }),
            ),
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }))
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        (status, Json(body)).into_response()
    }
}

// Make AppError cloneable for WithContext variant
impl Clone for AppError {
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` is simplified to `RowNotFound` during cloning.
    fn clone(&self) -> Self {
        match self {
            AppError::DatabaseError(_e) => AppError::DatabaseError(sqlx::Error::RowNotFound),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::Validation(msg) => AppError::Validation(msg.clone()),
            AppError::RateLimited(msg) => AppError::RateLimited(msg.clone()),
            AppError::EnrichmentUnavailable(msg) => AppError::EnrichmentUnavailable(msg.clone()),
            AppError::ScoringTimeout => AppError::ScoringTimeout,
            AppError::ContentGeneration(msg) => AppError::ContentGeneration(msg.clone()),
            AppError::Delivery(msg) => AppError::Delivery(msg.clone()),
            AppError::InvalidTransition { from, to, reason } => AppError::InvalidTransition {
                from: *from,
                to: *to,
                reason: reason.clone(),
            },
            AppError::AlreadyConverted {
                account_id,
                deal_id,
            } => AppError::AlreadyConverted {
                account_id: *account_id,
                deal_id: *deal_id,
            },
            AppError::Conversion(msg) => AppError::Conversion(msg.clone()),
            AppError::Conflict(msg) => AppError::Conflict(msg.clone()),
            AppError::ExternalApiError(msg) => AppError::ExternalApiError(msg.clone()),
            AppError::Unauthorized(msg) => AppError::Unauthorized(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}
