//! `/runs` routes: execution-run list/detail/current.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use orchestrator_store::ExecutionRun;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/runs", get(list_runs))
        .route("/runs/current", get(current_run))
        .route("/runs/:id", get(get_run))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/runs",
    responses((status = 200, description = "All execution runs", body = Vec<ExecutionRun>)),
    tag = "runs"
)]
pub async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<ExecutionRun>>, ApiError> {
    Ok(Json(state.store.list_execution_runs().await?))
}

#[utoipa::path(
    get,
    path = "/runs/{id}",
    params(("id" = Uuid, Path, description = "Execution run id")),
    responses(
        (status = 200, description = "Execution run", body = ExecutionRun),
        (status = 404, description = "Run not found", body = crate::error::ErrorBody),
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionRun>, ApiError> {
    let run = state
        .store
        .get_execution_run(id)
        .await
        .map_err(|_| ApiError::RunNotFound(id.to_string()))?;
    Ok(Json(run))
}

#[utoipa::path(
    get,
    path = "/runs/current",
    responses(
        (status = 200, description = "Currently active run", body = ExecutionRun),
        (status = 404, description = "No run is currently active", body = crate::error::ErrorBody),
    ),
    tag = "runs"
)]
pub async fn current_run(State(state): State<AppState>) -> Result<Json<ExecutionRun>, ApiError> {
    let run = state
        .store
        .current_execution_run()
        .await?
        .ok_or_else(|| ApiError::RunNotFound("current".to_string()))?;
    Ok(Json(run))
}
