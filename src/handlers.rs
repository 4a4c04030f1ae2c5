use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::DispatchOutcome;
use crate::engine::LeadEngine;
use crate::errors::AppError;
use crate::metrics::PipelineMetrics;
use crate::models::*;
use crate::webhook_handler::EventDeduper;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Lead pipeline and lifecycle commands.
    pub engine: Arc<LeadEngine>,
    /// Application configuration.
    pub config: Config,
    /// Recently seen webhook event ids.
    pub webhook_events: EventDeduper,
}

/// Health check endpoint.
///
/// Returns the service status and version.
pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "lead-engine",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

pub(crate) fn parse_channel(channel: &str) -> Result<LeadSource, AppError> {
    channel.parse::<LeadSource>().map_err(AppError::Validation)
}

/// POST /api/v1/intake/:channel
///
/// Accepts one raw submission. The lead is persisted before this returns;
/// scoring and the auto-response run in the background.
pub async fn intake(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<IntakeResponse>), AppError> {
    let source = parse_channel(&channel)?;
    tracing::info!("POST /intake/{}", source);

    let response = state.engine.submit(source, &payload).await?;
    let status = if response.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

/// GET /api/v1/leads
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeadQuery>,
) -> Result<Json<LeadPage>, AppError> {
    tracing::debug!("GET /leads - query: {:?}", query);
    Ok(Json(state.engine.list(&query).await?))
}

/// GET /api/v1/leads/:id
///
/// The lead with its auto-responses and the commands currently legal for it.
pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadDetail>, AppError> {
    tracing::debug!("GET /leads/{}", id);
    Ok(Json(state.engine.detail(id).await?))
}

/// POST /api/v1/leads/:id/rescore
pub async fn rescore_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Lead>, AppError> {
    tracing::info!("POST /leads/{}/rescore", id);
    Ok(Json(state.engine.rescore(id).await?))
}

/// POST /api/v1/leads/:id/claim
pub async fn claim_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<Lead>, AppError> {
    tracing::info!("POST /leads/{}/claim by {}", id, request.sdr_id);
    Ok(Json(state.engine.claim(id, &request.sdr_id).await?))
}

/// POST /api/v1/leads/:id/qualify
pub async fn qualify_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<QualifyRequest>,
) -> Result<Json<Lead>, AppError> {
    tracing::info!("POST /leads/{}/qualify", id);
    let lead = state
        .engine
        .qualify(id, &request.notes, request.ae_id.as_deref())
        .await?;
    Ok(Json(lead))
}

/// POST /api/v1/leads/:id/disqualify
pub async fn disqualify_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<DisqualifyRequest>,
) -> Result<Json<Lead>, AppError> {
    tracing::info!("POST /leads/{}/disqualify", id);
    Ok(Json(state.engine.disqualify(id, &request.notes).await?))
}

/// POST /api/v1/leads/:id/convert
pub async fn convert_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ConversionResult>), AppError> {
    tracing::info!("POST /leads/{}/convert", id);
    let result = state.engine.convert(id).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// POST /api/v1/leads/:id/respond
///
/// Manual re-dispatch. A transport failure is reported in the body with 502;
/// the lead is flagged for follow-up either way.
pub async fn respond_to_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DispatchOutcome>), AppError> {
    tracing::info!("POST /leads/{}/respond", id);
    let outcome = state.engine.respond(id).await?;
    let status = match outcome {
        DispatchOutcome::Sent { .. } => StatusCode::CREATED,
        DispatchOutcome::AlreadyRecorded { .. } => StatusCode::OK,
        DispatchOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(outcome)))
}

/// GET /api/v1/metrics
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PipelineMetrics>, AppError> {
    Ok(Json(state.engine.metrics().await?))
}
