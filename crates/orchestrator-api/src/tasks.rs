//! `/tasks` routes: listing, detail, stats, phase progress, retry.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use orchestrator_broadcast::BroadcastEvent;
use orchestrator_store::{Attempt, Task, TaskFilter, TaskStats, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/progress", get(task_progress))
        .route("/tasks/:task_key", get(get_task))
        .route("/tasks/:task_key/retry", post(retry_task))
        .with_state(state)
}

/// Query parameters for `GET /tasks`. `complexity` is accepted and validated but
/// otherwise ignored — no task field currently records it, so there is nothing to
/// filter on; see DESIGN.md.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListTasksParams {
    pub status: Option<String>,
    pub phase: Option<i32>,
    pub complexity: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

fn parse_status(raw: &str) -> Result<TaskStatus, ApiError> {
    serde_json::from_value(json!(raw))
        .map_err(|_| ApiError::InvalidQuery(format!("unknown status '{raw}'")))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[utoipa::path(
    get,
    path = "/tasks",
    params(
        ("status" = Option<String>, Query, description = "Filter by task status"),
        ("phase" = Option<i32>, Query, description = "Filter by phase number"),
        ("complexity" = Option<String>, Query, description = "Accepted, currently unused"),
        ("limit" = Option<i64>, Query, description = "Max rows (default 100)"),
        ("offset" = Option<i64>, Query, description = "Pagination offset"),
    ),
    responses(
        (status = 200, description = "Matching tasks", body = TaskListResponse),
        (status = 422, description = "Invalid status/phase/limit/offset"),
    ),
    tag = "tasks"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<TaskListResponse>, ApiError> {
    if params.limit < 0 || params.offset < 0 {
        return Err(ApiError::InvalidQuery("limit and offset must be >= 0".into()));
    }
    let status = params.status.as_deref().map(parse_status).transpose()?;

    let filter = TaskFilter {
        status,
        phase: params.phase,
        limit: params.limit,
        offset: params.offset,
    };
    let (tasks, total) = state.store.list_tasks(filter).await?;

    Ok(Json(TaskListResponse {
        tasks,
        total,
        limit: params.limit,
        offset: params.offset,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub attempts: Vec<Attempt>,
}

#[utoipa::path(
    get,
    path = "/tasks/{task_key}",
    params(("task_key" = String, Path, description = "Task key")),
    responses(
        (status = 200, description = "Task with its attempt history", body = TaskDetail),
        (status = 404, description = "Task not found"),
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_key): Path<String>,
) -> Result<Json<TaskDetail>, ApiError> {
    let task = state
        .store
        .get_task_by_key(&task_key)
        .await
        .map_err(|_| ApiError::TaskNotFound(task_key.clone()))?;
    let attempts = state.store.list_attempts(task.id).await?;
    Ok(Json(TaskDetail { task, attempts }))
}

#[utoipa::path(
    get,
    path = "/tasks/stats",
    responses(
        (status = 200, description = "Task counts by bucket", body = TaskStats),
        (status = 422, description = "pending + running + passed + failed != total"),
    ),
    tag = "tasks"
)]
pub async fn task_stats(State(state): State<AppState>) -> Result<Json<TaskStats>, ApiError> {
    let stats = state.store.task_stats().await?;
    if stats.pending + stats.running + stats.passed + stats.failed != stats.total {
        return Err(ApiError::ProgressInvariant);
    }
    Ok(Json(stats))
}

#[utoipa::path(
    get,
    path = "/tasks/progress",
    responses((status = 200, description = "Completion percent per phase", body = HashMap<String, f64>)),
    tag = "tasks"
)]
pub async fn task_progress(
    State(state): State<AppState>,
) -> Result<Json<HashMap<String, f64>>, ApiError> {
    let progress = state.store.phase_progress().await?;
    Ok(Json(progress.into_iter().map(|(phase, pct)| (phase.to_string(), pct)).collect()))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RetryResponse {
    pub task_key: String,
    pub status: &'static str,
}

/// Retryable iff the task is currently `blocked` or `blocked_static_review`.
/// A publish failure after the status flip does not roll the transition back.
#[utoipa::path(
    post,
    path = "/tasks/{task_key}/retry",
    params(("task_key" = String, Path, description = "Task key")),
    responses(
        (status = 200, description = "Task requeued", body = RetryResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is not in a retryable state"),
    ),
    tag = "tasks"
)]
pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_key): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let task = state
        .store
        .get_task_by_key(&task_key)
        .await
        .map_err(|_| ApiError::TaskNotFound(task_key.clone()))?;

    if !matches!(task.status, TaskStatus::Blocked | TaskStatus::BlockedStaticReview) {
        return Err(ApiError::TaskNotRetryable(task_key));
    }

    state.store.update_task_status(task.id, TaskStatus::Pending).await?;

    state
        .broadcaster
        .publish(BroadcastEvent::new(
            "task_status_changed",
            json!({
                "task_key": task_key,
                "old_status": task.status,
                "new_status": TaskStatus::Pending,
            }),
        ))
        .await;

    Ok(Json(RetryResponse {
        task_key,
        status: "pending",
    }))
}
