//! REST handlers for campaign operations and operational probes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use campaign_channels::HealthChecker;
use campaign_core::error::CampaignError;
use campaign_core::types::{Campaign, CampaignStatus, ScheduledTask};
use campaign_ledger::{export_entries, ExportFormat, LedgerStore, WebhookReconciler};
use campaign_orchestrator::{CampaignStats, LifecycleOutcome, NewCampaign, Orchestrator, StepInput};
use campaign_scheduler::TaskStore;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub reconciler: Arc<WebhookReconciler>,
    pub health: Arc<HealthChecker>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_body(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Map an engine error to its HTTP status.
pub(crate) fn api_error(err: CampaignError) -> ApiError {
    match &err {
        CampaignError::InvalidState { .. } => {
            warn!(error = %err, "Rejected lifecycle call");
            error_body(StatusCode::CONFLICT, "invalid_state", err.to_string())
        }
        CampaignError::NotFound { .. } => {
            error_body(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        CampaignError::Validation(_) | CampaignError::Serialization(_) => {
            metrics::counter!("api.validation_errors").increment(1);
            error_body(StatusCode::BAD_REQUEST, "validation_failed", err.to_string())
        }
        _ => {
            error!(error = %err, "Request failed");
            metrics::counter!("api.errors").increment(1);
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error",
            )
        }
    }
}

/// POST /v1/campaigns
pub async fn create_campaign(
    State(state): State<AppState>,
    Json(input): Json<NewCampaign>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state
        .orchestrator
        .create_campaign(input)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// GET /v1/campaigns
pub async fn list_campaigns(State(state): State<AppState>) -> Result<Json<Vec<Campaign>>, ApiError> {
    let campaigns = state.orchestrator.list_campaigns().await.map_err(api_error)?;
    Ok(Json(campaigns))
}

/// GET /v1/campaigns/:id
pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state.orchestrator.get_campaign(id).await.map_err(api_error)?;
    Ok(Json(campaign))
}

/// PUT /v1/campaigns/:id/steps
pub async fn set_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(steps): Json<Vec<StepInput>>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state
        .orchestrator
        .set_steps(id, steps)
        .await
        .map_err(api_error)?;
    Ok(Json(campaign))
}

/// POST /v1/campaigns/:id/start
///
/// The transition happens before the response; fan-out runs in the
/// background.
pub async fn start_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state.orchestrator.begin_start(id).await.map_err(api_error)?;
    if campaign.status == CampaignStatus::Active {
        let orchestrator = state.orchestrator.clone();
        let started = campaign.clone();
        tokio::spawn(async move {
            match orchestrator.fan_out(&started).await {
                Ok(tasks) => info!(campaign_id = %started.id, tasks, "Background fan-out finished"),
                Err(e) => error!(campaign_id = %started.id, error = %e, "Background fan-out failed"),
            }
        });
    }
    Ok((StatusCode::ACCEPTED, Json(campaign)))
}

/// POST /v1/campaigns/:id/pause
pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleOutcome>, ApiError> {
    let outcome = state.orchestrator.pause_campaign(id).await.map_err(api_error)?;
    Ok(Json(outcome))
}

/// POST /v1/campaigns/:id/resume
pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleOutcome>, ApiError> {
    let outcome = state.orchestrator.resume_campaign(id).await.map_err(api_error)?;
    Ok(Json(outcome))
}

/// POST /v1/campaigns/:id/complete
pub async fn complete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleOutcome>, ApiError> {
    let outcome = state
        .orchestrator
        .complete_campaign(id)
        .await
        .map_err(api_error)?;
    Ok(Json(outcome))
}

/// GET /v1/campaigns/:id/stats
pub async fn campaign_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignStats>, ApiError> {
    let stats = state.orchestrator.stats(id).await.map_err(api_error)?;
    Ok(Json(stats))
}

/// GET /v1/campaigns/:id/tasks
pub async fn campaign_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ScheduledTask>>, ApiError> {
    state.orchestrator.get_campaign(id).await.map_err(api_error)?;
    let tasks = state
        .orchestrator
        .tasks()
        .list_by_campaign(id)
        .await
        .map_err(api_error)?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
}

/// GET /v1/campaigns/:id/ledger/export?format=csv|json
pub async fn export_ledger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let format: ExportFormat = query
        .format
        .as_deref()
        .unwrap_or("json")
        .parse()
        .map_err(api_error)?;
    state.orchestrator.get_campaign(id).await.map_err(api_error)?;
    let rows = state
        .orchestrator
        .ledger()
        .list_by_campaign(id)
        .await
        .map_err(api_error)?;
    let (content_type, body) = export_entries(&rows, format).map_err(api_error)?;
    metrics::counter!("api.ledger_exports").increment(1);
    Ok(([(header::CONTENT_TYPE, content_type)], body))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        providers: state.orchestrator.providers().len(),
    })
}

/// GET /ready
///
/// Ready once the task store answers.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.orchestrator.tasks().count_by_campaign(Uuid::nil()).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Task store not reachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub providers: usize,
}
