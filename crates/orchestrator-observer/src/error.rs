use orchestrator_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("observer already running")]
    AlreadyRunning,
}
