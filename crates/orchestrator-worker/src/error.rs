use orchestrator_circuits::CircuitError;
use orchestrator_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Circuit(#[from] CircuitError),

    #[error("stage executor failed for task {task_id} stage {stage}: {message}")]
    Executor {
        task_id: i64,
        stage: orchestrator_store::Stage,
        message: String,
    },
}
