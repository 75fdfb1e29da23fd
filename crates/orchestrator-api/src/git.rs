//! External Git / PR collaborators: branch manipulation
//! and PR creation on a successful run are out of scope — specified only at this
//! contract surface. Invoked optionally, after the pool drains.

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("git collaborator failed for run {run_id}: {message}")]
pub struct GitError {
    pub run_id: Uuid,
    pub message: String,
}

/// Invoked once, after a run completes successfully. A failure here does not
/// retroactively fail the run — the coordinator logs it and proceeds to teardown.
#[async_trait]
pub trait GitCollaborator: Send + Sync + 'static {
    async fn on_run_succeeded(&self, run_id: Uuid) -> Result<(), GitError>;
}

/// No-op collaborator for embeddings that don't wire up Git/PR automation.
pub struct NoopGitCollaborator;

#[async_trait]
impl GitCollaborator for NoopGitCollaborator {
    async fn on_run_succeeded(&self, _run_id: Uuid) -> Result<(), GitError> {
        Ok(())
    }
}
