use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    #[error("task key not found: {0}")]
    TaskKeyNotFound(String),

    #[error("circuit not found: {0}")]
    CircuitNotFound(i64),

    #[error("execution run not found: {0}")]
    RunNotFound(Uuid),

    #[error("concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(
        "schema mismatch: missing {missing:?} — run the orchestrator's migrations \
         (`sqlx migrate run`) against this database before starting"
    )]
    SchemaMismatch { missing: Vec<String> },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
