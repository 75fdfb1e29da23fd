//! HTTP/SSE surface and run coordinator for the TDD task orchestrator.

pub mod circuits;
pub mod coordinator;
pub mod decomposer;
pub mod error;
pub mod events;
pub mod git;
pub mod health;
pub mod metrics;
pub mod runs;
pub mod state;
pub mod tasks;

pub use coordinator::{CoordinatorError, RunCoordinator, RunCoordinatorConfig, RunSummary, StopReason};
pub use decomposer::{DecomposeError, SpecDecomposer, StaticDecomposer};
pub use error::{ApiError, ErrorBody};
pub use git::{GitCollaborator, GitError, NoopGitCollaborator};
pub use state::AppState;
