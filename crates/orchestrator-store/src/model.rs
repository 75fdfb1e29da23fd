//! Entity types shared by every [`crate::store::TaskStore`] implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Passing,
    Complete,
    Blocked,
    BlockedStaticReview,
}

impl TaskStatus {
    /// Dependency gating treats both of these as "done".
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, TaskStatus::Passing | TaskStatus::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Red,
    Green,
    Verify,
    Fix,
    Refactor,
    ReVerify,
    Commit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Red => "red",
            Stage::Green => "green",
            Stage::Verify => "verify",
            Stage::Fix => "fix",
            Stage::Refactor => "refactor",
            Stage::ReVerify => "re_verify",
            Stage::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Task {
    pub id: i64,
    pub task_key: String,
    pub title: String,
    pub goal: String,
    pub phase: i32,
    pub sequence: i32,
    pub spec_id: Option<i64>,
    pub test_file: Option<String>,
    pub impl_file: Option<String>,
    pub verify_command: Option<String>,
    pub done_criteria: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub module_exports: Vec<String>,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewTask {
    pub task_key: String,
    pub title: String,
    pub goal: String,
    pub phase: i32,
    pub sequence: i32,
    pub spec_id: Option<i64>,
    pub test_file: Option<String>,
    pub impl_file: Option<String>,
    pub verify_command: Option<String>,
    pub done_criteria: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub module_exports: Vec<String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Attempt {
    pub id: i64,
    pub task_id: i64,
    pub stage: Stage,
    pub attempt_number: i32,
    pub success: bool,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewAttempt {
    pub task_id: i64,
    pub stage: Stage,
    pub attempt_number: i32,
    pub success: bool,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<i64>,
    pub branch_name: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Completed,
    Failed,
    Timeout,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskClaim {
    pub task_id: i64,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub outcome: Option<ClaimOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitLevel {
    Stage,
    Worker,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Persisted circuit row. Shared shape across all three [`CircuitLevel`]s; level-specific
/// counters that don't apply (e.g. `extensions_count` for a stage circuit) are left at zero.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerRow {
    pub id: i64,
    pub level: CircuitLevel,
    pub identifier: String,
    pub state: CircuitState,
    pub version: i64,
    pub failure_count: i32,
    pub success_count: i32,
    pub half_open_requests: i32,
    pub extensions_count: i32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub config_snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEventType {
    FailureRecorded,
    SuccessRecorded,
    ThresholdReached,
    RecoveryStarted,
    RecoverySucceeded,
    RecoveryFailed,
    ExtensionApplied,
    ManualReset,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCircuitEvent {
    pub circuit_id: i64,
    pub run_id: Option<Uuid>,
    pub event_type: CircuitEventType,
    pub from_state: Option<CircuitState>,
    pub to_state: Option<CircuitState>,
    pub error_context: Option<serde_json::Value>,
}

/// Append-only audit row persisted for every circuit transition or recorded outcome.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerEvent {
    pub id: i64,
    pub circuit_id: i64,
    pub run_id: Option<Uuid>,
    pub event_type: CircuitEventType,
    pub from_state: Option<CircuitState>,
    pub to_state: Option<CircuitState>,
    pub error_context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub max_workers: i32,
    pub total_invocations: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStats {
    pub pending: i64,
    pub running: i64,
    pub passed: i64,
    pub failed: i64,
    pub total: i64,
}

/// One external-executor invocation, tracked for budget accounting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Invocation {
    pub id: i64,
    pub run_id: Uuid,
    pub task_id: i64,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub phase: Option<i32>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            phase: None,
            limit: 100,
            offset: 0,
        }
    }
}
