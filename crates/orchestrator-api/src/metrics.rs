//! `GET /metrics`: Prometheus exposition format.

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::fmt::Write as _;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new().route("/metrics", get(metrics)).with_state(state)
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain"),
        (status = 500, description = "Collector failure"),
    ),
    tag = "metrics"
)]
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state
        .store
        .task_stats()
        .await
        .map_err(|e| ApiError::MetricsCollection(e.to_string()))?;
    let circuits = state
        .store
        .list_circuits(None, None)
        .await
        .map_err(|e| ApiError::MetricsCollection(e.to_string()))?;

    let mut out = String::new();

    let _ = writeln!(out, "# HELP orchestrator_tasks_total Tasks by terminal bucket");
    let _ = writeln!(out, "# TYPE orchestrator_tasks_total gauge");
    let _ = writeln!(out, "orchestrator_tasks_total{{status=\"pending\"}} {}", stats.pending);
    let _ = writeln!(out, "orchestrator_tasks_total{{status=\"running\"}} {}", stats.running);
    let _ = writeln!(out, "orchestrator_tasks_total{{status=\"passed\"}} {}", stats.passed);
    let _ = writeln!(out, "orchestrator_tasks_total{{status=\"failed\"}} {}", stats.failed);

    let _ = writeln!(out, "# HELP orchestrator_circuit_state 0=closed 1=half_open 2=open");
    let _ = writeln!(out, "# TYPE orchestrator_circuit_state gauge");
    for circuit in &circuits {
        let state_value = match circuit.state {
            orchestrator_store::CircuitState::Closed => 0,
            orchestrator_store::CircuitState::HalfOpen => 1,
            orchestrator_store::CircuitState::Open => 2,
        };
        let level = match circuit.level {
            orchestrator_store::CircuitLevel::Stage => "stage",
            orchestrator_store::CircuitLevel::Worker => "worker",
            orchestrator_store::CircuitLevel::System => "system",
        };
        let _ = writeln!(
            out,
            "orchestrator_circuit_state{{level=\"{level}\",identifier=\"{}\"}} {}",
            circuit.identifier, state_value
        );
    }

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
        .into_response())
}
