//! Route handler functions for all API endpoints.
//!
//! Each handler extracts query/path parameters via axum extractors, calls the
//! orchestrator, and returns JSON responses.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use eda_activation::{ActivationListItem, ActivationRead};
use eda_core::types::{
    ActivationInstance, ActivationInstanceLog, ActivationStatus, NewActivation, Page,
    PageRequest, RulesetStats,
};
use eda_storage::{ActivationFilter, InstanceFilter, LogFilter};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Query parameter types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ActivationListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub name: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub log: Option<String>,
}

// =============================================================================
// Request / response types
// =============================================================================

/// Body of a heartbeat. Empty bodies are accepted.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    pub ruleset_stats: Option<RulesetStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

// =============================================================================
// Helpers
// =============================================================================

/// Build a page request, clamping the size to the configured maximum.
fn page_request(state: &AppState, page: Option<u32>, page_size: Option<u32>) -> PageRequest {
    let size = page_size
        .unwrap_or(state.server.page_size)
        .min(state.server.max_page_size);
    PageRequest::new(page.unwrap_or(1), size)
}

/// Treat blank filter values as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// =============================================================================
// Health
// =============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Activations
// =============================================================================

/// POST /activations
pub async fn create_activation(
    State(state): State<AppState>,
    Json(body): Json<NewActivation>,
) -> Result<(StatusCode, Json<ActivationRead>), ApiError> {
    let read = state.orchestrator.create(body).await?;
    Ok((StatusCode::CREATED, Json(read)))
}

/// GET /activations
pub async fn list_activations(
    State(state): State<AppState>,
    Query(params): Query<ActivationListParams>,
) -> Result<Json<Page<ActivationListItem>>, ApiError> {
    let page = page_request(&state, params.page, params.page_size);
    let filter = ActivationFilter {
        name: non_empty(params.name),
    };
    Ok(Json(state.orchestrator.list(&filter, page).await?))
}

/// GET /activations/{id}
pub async fn get_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ActivationRead>, ApiError> {
    Ok(Json(state.orchestrator.retrieve(id).await?))
}

/// DELETE /activations/{id}
pub async fn delete_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /activations/{id}/enable
pub async fn enable_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.enable(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /activations/{id}/disable
pub async fn disable_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.disable(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /activations/{id}/restart
pub async fn restart_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.restart(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /activations/{id}/instances
pub async fn list_activation_instances(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<InstanceListParams>,
) -> Result<Json<Page<ActivationInstance>>, ApiError> {
    let status = match non_empty(params.status) {
        Some(raw) => Some(raw.parse::<ActivationStatus>().map_err(ApiError::BadRequest)?),
        None => None,
    };
    let page = page_request(&state, params.page, params.page_size);
    let filter = InstanceFilter {
        name: non_empty(params.name),
        status,
    };
    Ok(Json(
        state.orchestrator.list_instances(id, &filter, page).await?,
    ))
}

// =============================================================================
// Activation instances
// =============================================================================

/// GET /activation-instances/{id}
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ActivationInstance>, ApiError> {
    Ok(Json(state.orchestrator.get_instance(id).await?))
}

/// GET /activation-instances/{id}/logs
pub async fn list_instance_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<LogListParams>,
) -> Result<Json<Page<ActivationInstanceLog>>, ApiError> {
    let page = page_request(&state, params.page, params.page_size);
    let filter = LogFilter {
        log: non_empty(params.log),
    };
    Ok(Json(state.orchestrator.list_logs(id, &filter, page).await?))
}

/// POST /activation-instances/{id}/heartbeat
pub async fn instance_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice::<HeartbeatRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid heartbeat body: {}", e)))?
    };
    state
        .orchestrator
        .record_heartbeat(id, request.ruleset_stats)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
