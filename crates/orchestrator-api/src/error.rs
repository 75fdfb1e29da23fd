//! Translates internal errors to a structured `{detail, error_code?}` JSON body
//! at the HTTP boundary. Never leaks a stack trace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use orchestrator_circuits::CircuitError;
use orchestrator_store::StoreError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

/// Errors surfaced across the HTTP surface. Each variant carries its own status
/// code and, for the stable ones, an `error_code`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("circuit not found: {0}")]
    CircuitNotFound(String),

    #[error("task {0} is not in a retryable state")]
    TaskNotRetryable(String),

    #[error("invalid query parameter: {0}")]
    InvalidQuery(String),

    #[error("progress invariant violated: completed + failed + pending != total")]
    ProgressInvariant,

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error(transparent)]
    Circuit(#[from] CircuitError),

    #[error("metrics collection failed: {0}")]
    MetricsCollection(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::TaskNotFound(_) | ApiError::RunNotFound(_) | ApiError::CircuitNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::TaskNotRetryable(_) => StatusCode::CONFLICT,
            ApiError::InvalidQuery(_) | ApiError::ProgressInvariant => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Circuit(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::MetricsCollection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> Option<&'static str> {
        match self {
            ApiError::RunNotFound(_) => Some("ERR-RUN-404"),
            ApiError::TaskNotFound(_) => Some("ERR-TASK-404"),
            ApiError::CircuitNotFound(_) => Some("ERR-CIRCUIT-404"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            detail: self.to_string(),
            error_code: self.error_code(),
        };
        if status.is_server_error() {
            tracing::error!(error = %body.detail, "request failed");
        } else {
            tracing::debug!(error = %body.detail, status = %status, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}
