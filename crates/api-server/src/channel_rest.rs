//! Provider management and vendor webhook ingress.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_channels::{HealthStatus, ProviderRecord, ProviderUsage};
use campaign_core::types::Channel;
use campaign_ledger::ReconcileReport;

use crate::rest::{api_error, error_body, ApiError, AppState};

/// Provider as shown by the API. Credentials are never echoed.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderView {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub channel: Channel,
    pub daily_limit: u64,
    pub monthly_limit: u64,
    pub priority: u8,
    pub is_default: bool,
    pub is_active: bool,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl From<ProviderRecord> for ProviderView {
    fn from(record: ProviderRecord) -> Self {
        let s = record.settings;
        Self {
            id: s.id,
            kind: s.credentials.kind().to_string(),
            channel: s.credentials.channel(),
            name: s.name,
            daily_limit: s.daily_limit,
            monthly_limit: s.monthly_limit,
            priority: s.priority,
            is_default: s.is_default,
            is_active: s.is_active,
            health: record.health,
            last_health_check: record.last_health_check,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub provider_id: Uuid,
    pub health: HealthStatus,
}

/// GET /v1/providers
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderView>> {
    let providers = state
        .orchestrator
        .providers()
        .list(None)
        .into_iter()
        .map(ProviderView::from)
        .collect();
    Json(providers)
}

/// GET /v1/providers/:id/usage
pub async fn provider_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProviderUsage>, ApiError> {
    let usage = state
        .orchestrator
        .providers()
        .usage(id)
        .await
        .map_err(api_error)?;
    Ok(Json(usage))
}

/// POST /v1/providers/:id/health-check
pub async fn check_provider_health(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HealthCheckResponse>, ApiError> {
    let health = state.health.check_one(id).await.map_err(api_error)?;
    Ok(Json(HealthCheckResponse {
        provider_id: id,
        health,
    }))
}

/// POST /v1/providers/:id/reset-usage
pub async fn reset_provider_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .providers()
        .reset_usage(id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /webhook/:channel
///
/// Acknowledged with 200 for every parseable body, including unknown ids
/// and events. Only a body that cannot be parsed at all gets a 400.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReconcileReport>, ApiError> {
    let Some(channel) = Channel::parse(&channel) else {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            "unknown_channel",
            format!("no webhook endpoint for channel '{channel}'"),
        ));
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    match state.reconciler.reconcile(channel, &body, content_type).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(error_body(
            StatusCode::BAD_REQUEST,
            "malformed_payload",
            e.to_string(),
        )),
    }
}
