//! The external decomposer contract: turning a product
//! spec into task rows is out of scope for this crate. The run coordinator only
//! drives *when* decomposition runs and what happens to its output.

use async_trait::async_trait;
use orchestrator_store::NewTask;

#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("spec path not readable: {0}")]
    SpecUnreadable(String),

    #[error("decomposition failed: {0}")]
    Failed(String),
}

/// External collaborator that reads a product spec and produces the [`NewTask`]
/// rows the run coordinator inserts into the store. The orchestrator never
/// inspects how decomposition itself happens.
#[async_trait]
pub trait SpecDecomposer: Send + Sync + 'static {
    async fn decompose(&self, spec_path: &str) -> Result<Vec<NewTask>, DecomposeError>;
}

/// A decomposer that yields a fixed, pre-computed set of tasks. Useful for tests
/// and for embeddings where decomposition already happened upstream.
pub struct StaticDecomposer {
    tasks: Vec<NewTask>,
}

impl StaticDecomposer {
    pub fn new(tasks: Vec<NewTask>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl SpecDecomposer for StaticDecomposer {
    async fn decompose(&self, _spec_path: &str) -> Result<Vec<NewTask>, DecomposeError> {
        Ok(self.tasks.clone())
    }
}
