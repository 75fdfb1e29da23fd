//! `/circuits` routes: list/detail/reset triad plus an aggregate
//! health summary.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use orchestrator_store::{CircuitBreakerRow, CircuitEventType, CircuitLevel, CircuitState, CircuitUpdate, NewCircuitEvent};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

/// Bound on retries when another writer wins the optimistic race on the same row;
/// a reset losing every attempt surfaces as a 503 rather than looping forever.
const MAX_RESET_ATTEMPTS: u32 = 5;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/circuits", get(list_circuits))
        .route("/circuits/health", get(circuits_health))
        .route("/circuits/:id", get(get_circuit))
        .route("/circuits/:id/reset", post(reset_circuit))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListCircuitsParams {
    pub level: Option<CircuitLevel>,
    pub state: Option<CircuitState>,
}

#[utoipa::path(
    get,
    path = "/circuits",
    params(
        ("level" = Option<CircuitLevel>, Query, description = "Filter by circuit level"),
        ("state" = Option<CircuitState>, Query, description = "Filter by circuit state"),
    ),
    responses((status = 200, description = "Matching circuit rows", body = Vec<CircuitBreakerRow>)),
    tag = "circuits"
)]
pub async fn list_circuits(
    State(state): State<AppState>,
    Query(params): Query<ListCircuitsParams>,
) -> Result<Json<Vec<CircuitBreakerRow>>, ApiError> {
    Ok(Json(state.store.list_circuits(params.level, params.state).await?))
}

#[utoipa::path(
    get,
    path = "/circuits/{id}",
    params(("id" = i64, Path, description = "Circuit row id")),
    responses(
        (status = 200, description = "Circuit row", body = CircuitBreakerRow),
        (status = 404, description = "Circuit not found"),
    ),
    tag = "circuits"
)]
pub async fn get_circuit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CircuitBreakerRow>, ApiError> {
    let row = state
        .store
        .get_circuit_by_id(id)
        .await
        .map_err(|_| ApiError::CircuitNotFound(id.to_string()))?;
    Ok(Json(row))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CircuitsHealthResponse {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,
}

#[utoipa::path(
    get,
    path = "/circuits/health",
    responses((status = 200, description = "Aggregate circuit health", body = CircuitsHealthResponse)),
    tag = "circuits"
)]
pub async fn circuits_health(
    State(state): State<AppState>,
) -> Result<Json<CircuitsHealthResponse>, ApiError> {
    let rows = state.store.list_circuits(None, None).await?;
    let open = rows.iter().filter(|c| c.state == CircuitState::Open).count();
    let half_open = rows.iter().filter(|c| c.state == CircuitState::HalfOpen).count();
    let closed = rows.iter().filter(|c| c.state == CircuitState::Closed).count();
    Ok(Json(CircuitsHealthResponse {
        total: rows.len(),
        open,
        half_open,
        closed,
    }))
}

/// Force-closes a circuit regardless of level. Bypasses any live in-process
/// circuit object the worker pool may hold for this identifier — on its next
/// access that object reloads from the store and observes the reset — the
/// persisted row is always the source of truth.
#[utoipa::path(
    post,
    path = "/circuits/{id}/reset",
    params(("id" = i64, Path, description = "Circuit row id")),
    responses(
        (status = 200, description = "Circuit reset to closed", body = CircuitBreakerRow),
        (status = 404, description = "Circuit not found"),
        (status = 503, description = "Store unavailable or reset lost the optimistic race repeatedly"),
    ),
    tag = "circuits"
)]
pub async fn reset_circuit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CircuitBreakerRow>, ApiError> {
    for _ in 0..MAX_RESET_ATTEMPTS {
        let row = state
            .store
            .get_circuit_by_id(id)
            .await
            .map_err(|_| ApiError::CircuitNotFound(id.to_string()))?;

        if row.state == CircuitState::Closed {
            return Ok(Json(row));
        }

        let fields = CircuitUpdate::new()
            .with_state(CircuitState::Closed)
            .with_failure_count(0)
            .with_half_open_requests(0);
        let updated = state.store.update_circuit(id, row.version, fields).await?;
        if !updated {
            continue;
        }

        state
            .store
            .record_circuit_event(NewCircuitEvent {
                circuit_id: id,
                run_id: row.run_id,
                event_type: CircuitEventType::ManualReset,
                from_state: Some(row.state),
                to_state: Some(CircuitState::Closed),
                error_context: None,
            })
            .await?;

        let fresh = state
            .store
            .get_circuit_by_id(id)
            .await
            .map_err(|_| ApiError::CircuitNotFound(id.to_string()))?;
        return Ok(Json(fresh));
    }

    Err(ApiError::StoreUnavailable(orchestrator_store::StoreError::Database(format!(
        "circuit {id} could not be reset after {MAX_RESET_ATTEMPTS} attempts"
    ))))
}
