//! The external stage-executor contract: LLM/model invocation that actually writes
//! code for each stage is out of scope for this crate — it is modeled only at this
//! trait boundary. Prompt assembly, AST-based linting, and Git branch manipulation
//! are likewise external collaborators the executor may call internally; the
//! orchestrator never sees them.

use async_trait::async_trait;
use orchestrator_store::{Stage, Task};

/// Truncation bound applied only to the feedback context threaded between GREEN
/// attempts — the recorded [`orchestrator_store::Attempt`] row is never truncated.
pub const MAX_TEST_OUTPUT_SIZE: usize = 16 * 1024;

/// One invocation of the external stage executor.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub task: Task,
    pub stage: Stage,
    /// On GREEN attempt ≥ 2, the previous attempt's output, truncated to
    /// [`MAX_TEST_OUTPUT_SIZE`] bytes.
    pub previous_failure: Option<String>,
}

/// What a stage executor invocation yields: success/failure plus diagnostics for
/// the [`orchestrator_store::Attempt`] row.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl StageResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            exit_code: Some(0),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            exit_code: Some(1),
        }
    }
}

/// External collaborator that performs one pipeline stage for one task: writing
/// failing tests (RED), writing an implementation (GREEN), running tooling
/// (VERIFY/FIX), or refactoring (REFACTOR). The orchestrator drives *when* this is
/// called and what happens to the result; it never inspects how the stage is
/// actually carried out.
#[async_trait]
pub trait StageExecutor: Send + Sync + 'static {
    async fn execute(&self, request: StageRequest) -> StageResult;
}

/// Truncates `s` to at most `MAX_TEST_OUTPUT_SIZE` bytes, preferring to cut at a
/// char boundary so the result remains valid UTF-8.
pub fn truncate_for_feedback(s: &str) -> String {
    if s.len() <= MAX_TEST_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_TEST_OUTPUT_SIZE;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_pass_through() {
        assert_eq!(truncate_for_feedback("hello"), "hello");
    }

    #[test]
    fn long_strings_are_truncated() {
        let s = "a".repeat(MAX_TEST_OUTPUT_SIZE + 100);
        let truncated = truncate_for_feedback(&s);
        assert_eq!(truncated.len(), MAX_TEST_OUTPUT_SIZE);
    }
}
