use std::time::Duration;

use orchestrator_store::StoreError;

/// Errors surfaced by the circuit hierarchy. `Open` is the common case a worker
/// treats as "skip this stage/task", not as a crash.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit {identifier} is open, retry after {retry_after:?}")]
    Open {
        identifier: String,
        retry_after: Option<Duration>,
    },

    #[error("circuit {identifier} is permanently open after exhausting extensions")]
    PermanentlyOpen { identifier: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
