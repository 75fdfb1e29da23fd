//! `GET /health`: aggregate health over every currently-open circuit.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use orchestrator_store::CircuitLevel;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpenCircuitSummary {
    pub level: CircuitLevel,
    pub identifier: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub circuits: Vec<OpenCircuitSummary>,
    pub timestamp: DateTime<Utc>,
}

/// Degraded when any stage/worker circuit is open; unhealthy (503) when the
/// system circuit is open.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
        (status = 503, description = "System-level circuit open or probe failed"),
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Result<Response, ApiError> {
    let open = state.store.list_circuits(None, Some(orchestrator_store::CircuitState::Open)).await?;

    let system_open = open.iter().any(|c| c.level == CircuitLevel::System);
    let status = if system_open {
        HealthStatus::Unhealthy
    } else if open.is_empty() {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };

    let body = HealthResponse {
        status,
        circuits: open
            .into_iter()
            .map(|c| OpenCircuitSummary {
                level: c.level,
                identifier: c.identifier,
            })
            .collect(),
        timestamp: Utc::now(),
    };

    let code = if status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((code, Json(body)).into_response())
}
