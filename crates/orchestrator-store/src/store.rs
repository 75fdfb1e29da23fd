//! The [`TaskStore`] trait: the single persistence seam every task, attempt, worker,
//! claim, circuit, run, and config mutation passes through.
//!
//! Every mutation that could race with another writer is modeled as a conditional
//! operation returning `bool` (or an `Option`/count) rather than an error — see
//! [`TaskStore::claim_task`] and [`TaskStore::update_circuit`]. Callers re-read and
//! retry, or move on to the next candidate; contention is not an error.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::*;

/// Fields that may change on an optimistic-locked circuit update. `None` leaves the
/// field untouched.
#[derive(Debug, Clone, Default)]
pub struct CircuitUpdate {
    pub state: Option<CircuitState>,
    pub failure_count: Option<i32>,
    pub success_count: Option<i32>,
    pub half_open_requests: Option<i32>,
    pub extensions_count: Option<i32>,
    pub opened_at: Option<Option<DateTime<Utc>>>,
    pub last_failure_at: Option<Option<DateTime<Utc>>>,
    pub last_success_at: Option<Option<DateTime<Utc>>>,
    pub last_state_change_at: Option<Option<DateTime<Utc>>>,
    pub config_snapshot: Option<serde_json::Value>,
}

impl CircuitUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: CircuitState) -> Self {
        self.state = Some(state);
        self.last_state_change_at = Some(Some(Utc::now()));
        self
    }

    pub fn with_failure_count(mut self, n: i32) -> Self {
        self.failure_count = Some(n);
        self
    }

    pub fn with_success_count(mut self, n: i32) -> Self {
        self.success_count = Some(n);
        self
    }

    pub fn with_half_open_requests(mut self, n: i32) -> Self {
        self.half_open_requests = Some(n);
        self
    }

    pub fn with_extensions_count(mut self, n: i32) -> Self {
        self.extensions_count = Some(n);
        self
    }

    pub fn with_opened_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.opened_at = Some(at);
        self
    }

    pub fn with_last_failure_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_failure_at = Some(at);
        self
    }

    pub fn with_last_success_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_success_at = Some(at);
        self
    }

    pub fn with_config_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.config_snapshot = Some(snapshot);
        self
    }
}

/// Durable, transactional, single-writer-serialized store for tasks, attempts,
/// workers, claims, circuits, circuit events, execution runs, invocations, and
/// config. Implementations must be `Send + Sync` and safe under concurrent use.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // ---- Tasks --------------------------------------------------------------

    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError>;
    async fn get_task(&self, id: i64) -> Result<Task, StoreError>;
    async fn get_task_by_key(&self, task_key: &str) -> Result<Task, StoreError>;
    async fn list_tasks(&self, filter: TaskFilter) -> Result<(Vec<Task>, i64), StoreError>;
    async fn task_stats(&self) -> Result<TaskStats, StoreError>;

    /// `{task_key -> status}` for every task, used by the DB observer's polling diff.
    async fn task_status_snapshot(&self) -> Result<HashMap<String, TaskStatus>, StoreError>;

    /// Per-phase completion percentage, counting only `passing` toward progress.
    /// Note the asymmetry with dependency gating, where `complete` also counts —
    /// both are intentional, see [`TaskStatus::satisfies_dependency`].
    async fn phase_progress(&self) -> Result<HashMap<i32, f64>, StoreError>;

    async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError>;

    /// Returns the next claimable task ordered by `(phase, sequence)`, or `None` if
    /// none are ready. Does not itself claim it.
    async fn next_ready_task(&self) -> Result<Option<Task>, StoreError>;

    /// Conditional claim: succeeds only if the task is `pending` or its lease has
    /// expired. Returns `false` on lost race — the caller should try the next
    /// candidate, not retry this one.
    async fn claim_task(
        &self,
        task_id: i64,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, StoreError>;

    /// Releases a claim this worker holds, recording the outcome on the active
    /// [`TaskClaim`] row.
    async fn release_task(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: ClaimOutcome,
    ) -> Result<(), StoreError>;

    /// Bulk-reclaims every `in_progress` task whose lease has expired, returning them
    /// to `pending`. Returns the number reclaimed.
    async fn reclaim_stale(&self) -> Result<u64, StoreError>;

    // ---- Attempts -------------------------------------------------------------

    /// Inserts a dense, monotonic attempt row for `(task_id, stage)`.
    async fn record_attempt(&self, attempt: NewAttempt) -> Result<Attempt, StoreError>;
    async fn list_attempts(&self, task_id: i64) -> Result<Vec<Attempt>, StoreError>;

    // ---- Workers ----------------------------------------------------------------

    async fn register_worker(&self, worker_id: &str) -> Result<(), StoreError>;
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError>;
    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        current_task_id: Option<i64>,
    ) -> Result<(), StoreError>;
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError>;
    async fn stale_workers(&self, stale_after: chrono::Duration) -> Result<Vec<WorkerInfo>, StoreError>;

    // ---- Circuit breakers -------------------------------------------------------

    async fn get_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
    ) -> Result<Option<CircuitBreakerRow>, StoreError>;

    async fn get_circuit_by_id(&self, id: i64) -> Result<CircuitBreakerRow, StoreError>;

    async fn create_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
        run_id: Option<Uuid>,
        config_snapshot: serde_json::Value,
    ) -> Result<CircuitBreakerRow, StoreError>;

    /// Optimistic update: succeeds only if `expected_version` still matches the
    /// stored row's version. Returns `false` on lost update — the caller should
    /// re-read the row via [`TaskStore::get_circuit_by_id`].
    async fn update_circuit(
        &self,
        id: i64,
        expected_version: i64,
        fields: CircuitUpdate,
    ) -> Result<bool, StoreError>;

    async fn list_circuits(
        &self,
        level: Option<CircuitLevel>,
        state: Option<CircuitState>,
    ) -> Result<Vec<CircuitBreakerRow>, StoreError>;

    async fn record_circuit_event(&self, event: NewCircuitEvent) -> Result<(), StoreError>;
    async fn list_circuit_events(
        &self,
        circuit_id: i64,
    ) -> Result<Vec<CircuitBreakerEvent>, StoreError>;

    // ---- Execution runs -----------------------------------------------------------

    async fn start_execution_run(&self, max_workers: i32) -> Result<ExecutionRun, StoreError>;
    async fn complete_execution_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<(), StoreError>;
    async fn get_execution_run(&self, run_id: Uuid) -> Result<ExecutionRun, StoreError>;
    async fn current_execution_run(&self) -> Result<Option<ExecutionRun>, StoreError>;
    async fn list_execution_runs(&self) -> Result<Vec<ExecutionRun>, StoreError>;

    // ---- Invocations (budget accounting) -------------------------------------------

    async fn record_invocation(
        &self,
        run_id: Uuid,
        task_id: i64,
        stage: Stage,
    ) -> Result<(), StoreError>;
    async fn invocation_count(&self, run_id: Uuid) -> Result<i64, StoreError>;

    // ---- Config -----------------------------------------------------------------

    /// Reads the raw value for `key`, parses it as an integer, and clamps it against
    /// [`crate::config::CONFIG_BOUNDS`] if registered there. An unset or unparseable
    /// value falls back to the registered default (or the caller's `default`).
    async fn get_config_int(&self, key: &str, default: i64) -> Result<i64, StoreError>;
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError>;

    // ---- Out-of-scope collaborator sinks -----------------------------------------

    /// Pass-through logging sink for the external Git-coordination collaborator; the
    /// orchestrator never inspects its contents.
    async fn log_stash_operation(
        &self,
        task_id: i64,
        operation: &str,
        detail: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Pass-through logging sink for the external AST-based static review collaborator.
    async fn log_static_review_metric(
        &self,
        task_id: i64,
        metric: &str,
        value: f64,
    ) -> Result<(), StoreError>;
}
