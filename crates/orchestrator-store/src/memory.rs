//! In-memory [`TaskStore`] implementation.
//!
//! Used by tests and by any single-process embedding of the orchestrator. All state
//! lives behind one `tokio::sync::RwLock`: every mutation takes the write guard,
//! reads take the read guard and observe a consistent snapshot.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::parse_and_clamp;
use crate::error::StoreError;
use crate::model::*;
use crate::store::{CircuitUpdate, TaskStore};

#[derive(Default)]
struct Inner {
    tasks: HashMap<i64, Task>,
    task_keys: HashMap<String, i64>,
    next_task_id: i64,

    attempts: HashMap<i64, Vec<Attempt>>,
    next_attempt_id: i64,

    claims: Vec<TaskClaim>,

    workers: HashMap<String, WorkerInfo>,

    circuits: HashMap<i64, CircuitBreakerRow>,
    circuit_index: HashMap<(CircuitLevel, String), i64>,
    next_circuit_id: i64,

    circuit_events: Vec<CircuitBreakerEvent>,
    next_event_id: i64,

    runs: HashMap<Uuid, ExecutionRun>,

    invocations: HashMap<Uuid, Vec<Invocation>>,
    next_invocation_id: i64,

    config: HashMap<String, String>,
}

/// In-memory implementation of [`TaskStore`].
///
/// ```
/// use orchestrator_store::InMemoryTaskStore;
/// let _store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn dependencies_satisfied(task: &Task, tasks: &HashMap<i64, Task>, task_keys: &HashMap<String, i64>) -> bool {
    task.depends_on.iter().all(|dep_key| {
        task_keys
            .get(dep_key)
            .and_then(|id| tasks.get(id))
            .map(|dep| dep.status.satisfies_dependency())
            .unwrap_or(false) // a non-existent dependency key blocks the task indefinitely
    })
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let row = Task {
            id,
            task_key: task.task_key.clone(),
            title: task.title,
            goal: task.goal,
            phase: task.phase,
            sequence: task.sequence,
            spec_id: task.spec_id,
            test_file: task.test_file,
            impl_file: task.impl_file,
            verify_command: task.verify_command,
            done_criteria: task.done_criteria,
            acceptance_criteria: task.acceptance_criteria,
            module_exports: task.module_exports,
            depends_on: task.depends_on,
            status: TaskStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            claim_expires_at: None,
            version: 1,
        };
        inner.task_keys.insert(task.task_key, id);
        inner.tasks.insert(id, row.clone());
        Ok(row)
    }

    async fn get_task(&self, id: i64) -> Result<Task, StoreError> {
        let inner = self.inner.read().await;
        inner.tasks.get(&id).cloned().ok_or(StoreError::TaskNotFound(id))
    }

    async fn get_task_by_key(&self, task_key: &str) -> Result<Task, StoreError> {
        let inner = self.inner.read().await;
        let id = inner
            .task_keys
            .get(task_key)
            .ok_or_else(|| StoreError::TaskKeyNotFound(task_key.to_string()))?;
        inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskKeyNotFound(task_key.to_string()))
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<(Vec<Task>, i64), StoreError> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| filter.status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| filter.phase.map(|p| t.phase == p).unwrap_or(true))
            .collect();
        matching.sort_by_key(|t| (t.phase, t.sequence));
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn task_stats(&self) -> Result<TaskStats, StoreError> {
        let inner = self.inner.read().await;
        let mut stats = TaskStats {
            pending: 0,
            running: 0,
            passed: 0,
            failed: 0,
            total: 0,
        };
        for task in inner.tasks.values() {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.running += 1,
                TaskStatus::Passing | TaskStatus::Complete => stats.passed += 1,
                TaskStatus::Blocked | TaskStatus::BlockedStaticReview => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn task_status_snapshot(&self) -> Result<HashMap<String, TaskStatus>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .map(|t| (t.task_key.clone(), t.status))
            .collect())
    }

    async fn phase_progress(&self) -> Result<HashMap<i32, f64>, StoreError> {
        let inner = self.inner.read().await;
        let mut totals: HashMap<i32, (i64, i64)> = HashMap::new();
        for task in inner.tasks.values() {
            let entry = totals.entry(task.phase).or_insert((0, 0));
            entry.0 += 1;
            if task.status == TaskStatus::Passing {
                entry.1 += 1;
            }
        }
        Ok(totals
            .into_iter()
            .map(|(phase, (total, passing))| {
                let pct = if total == 0 {
                    0.0
                } else {
                    (passing as f64 / total as f64) * 100.0
                };
                (phase, pct)
            })
            .collect())
    }

    async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = status;
        task.version += 1;
        Ok(())
    }

    async fn next_ready_task(&self) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut candidates: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| {
                let claimable = t.status == TaskStatus::Pending
                    || (t.status == TaskStatus::InProgress
                        && t.claim_expires_at.map(|exp| exp < now).unwrap_or(false));
                claimable && dependencies_satisfied(t, &inner.tasks, &inner.task_keys)
            })
            .collect();
        candidates.sort_by_key(|t| (t.phase, t.sequence));
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    async fn claim_task(
        &self,
        task_id: i64,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let claimable = {
            let task = inner
                .tasks
                .get(&task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;
            task.status == TaskStatus::Pending
                || task.claim_expires_at.map(|exp| exp < now).unwrap_or(task.claimed_by.is_none())
        };
        if !claimable {
            return Ok(false);
        }
        let task = inner.tasks.get_mut(&task_id).expect("checked above");
        task.status = TaskStatus::InProgress;
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.claim_expires_at = Some(now + ChronoDuration::seconds(lease_seconds));
        task.version += 1;
        inner.claims.push(TaskClaim {
            task_id,
            worker_id: worker_id.to_string(),
            claimed_at: now,
            released_at: None,
            outcome: None,
        });
        Ok(true)
    }

    async fn release_task(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: ClaimOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            if task.claimed_by.as_deref() == Some(worker_id) {
                task.claimed_by = None;
                task.claimed_at = None;
                task.claim_expires_at = None;
                task.version += 1;
            }
        }
        if let Some(claim) = inner
            .claims
            .iter_mut()
            .rev()
            .find(|c| c.task_id == task_id && c.worker_id == worker_id && c.released_at.is_none())
        {
            claim.released_at = Some(now);
            claim.outcome = Some(outcome);
        }
        Ok(())
    }

    async fn reclaim_stale(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut count = 0u64;
        let stale_ids: Vec<i64> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::InProgress
                    && t.claim_expires_at.map(|exp| exp < now).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();
        for id in &stale_ids {
            if let Some(task) = inner.tasks.get_mut(id) {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.claimed_at = None;
                task.claim_expires_at = None;
                task.version += 1;
                count += 1;
            }
        }
        for claim in inner.claims.iter_mut() {
            if stale_ids.contains(&claim.task_id) && claim.released_at.is_none() {
                claim.released_at = Some(now);
                claim.outcome = Some(ClaimOutcome::Timeout);
            }
        }
        Ok(count)
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> Result<Attempt, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_attempt_id += 1;
        let id = inner.next_attempt_id;
        let now = Utc::now();
        let row = Attempt {
            id,
            task_id: attempt.task_id,
            stage: attempt.stage,
            attempt_number: attempt.attempt_number,
            success: attempt.success,
            error_message: attempt.error_message,
            exit_code: attempt.exit_code,
            output: attempt.output,
            started_at: now,
            completed_at: Some(now),
        };
        inner.attempts.entry(attempt.task_id).or_default().push(row.clone());
        Ok(row)
    }

    async fn list_attempts(&self, task_id: i64) -> Result<Vec<Attempt>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.attempts.get(&task_id).cloned().unwrap_or_default())
    }

    async fn register_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.workers.insert(
            worker_id.to_string(),
            WorkerInfo {
                id: worker_id.to_string(),
                status: WorkerStatus::Active,
                current_task_id: None,
                branch_name: None,
                last_heartbeat: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.workers.remove(worker_id);
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        current_task_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.last_heartbeat = Some(Utc::now());
            worker.current_task_id = current_task_id;
            worker.status = if current_task_id.is_some() {
                WorkerStatus::Active
            } else {
                WorkerStatus::Idle
            };
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.workers.values().cloned().collect())
    }

    async fn stale_workers(&self, stale_after: ChronoDuration) -> Result<Vec<WorkerInfo>, StoreError> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        Ok(inner
            .workers
            .values()
            .filter(|w| {
                w.last_heartbeat
                    .map(|hb| now - hb > stale_after)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn get_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
    ) -> Result<Option<CircuitBreakerRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .circuit_index
            .get(&(level, identifier.to_string()))
            .and_then(|id| inner.circuits.get(id))
            .cloned())
    }

    async fn get_circuit_by_id(&self, id: i64) -> Result<CircuitBreakerRow, StoreError> {
        let inner = self.inner.read().await;
        inner.circuits.get(&id).cloned().ok_or(StoreError::CircuitNotFound(id))
    }

    async fn create_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
        run_id: Option<Uuid>,
        config_snapshot: serde_json::Value,
    ) -> Result<CircuitBreakerRow, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .circuit_index
            .get(&(level, identifier.to_string()))
            .and_then(|id| inner.circuits.get(id))
        {
            return Ok(existing.clone());
        }
        inner.next_circuit_id += 1;
        let id = inner.next_circuit_id;
        let now = Utc::now();
        let row = CircuitBreakerRow {
            id,
            level,
            identifier: identifier.to_string(),
            state: CircuitState::Closed,
            version: 1,
            failure_count: 0,
            success_count: 0,
            half_open_requests: 0,
            extensions_count: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
            last_state_change_at: Some(now),
            run_id,
            config_snapshot,
        };
        inner.circuit_index.insert((level, identifier.to_string()), id);
        inner.circuits.insert(id, row.clone());
        Ok(row)
    }

    async fn update_circuit(
        &self,
        id: i64,
        expected_version: i64,
        fields: CircuitUpdate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let row = match inner.circuits.get_mut(&id) {
            Some(r) => r,
            None => return Err(StoreError::CircuitNotFound(id)),
        };
        if row.version != expected_version {
            return Ok(false);
        }
        if let Some(v) = fields.state {
            row.state = v;
        }
        if let Some(v) = fields.failure_count {
            row.failure_count = v;
        }
        if let Some(v) = fields.success_count {
            row.success_count = v;
        }
        if let Some(v) = fields.half_open_requests {
            row.half_open_requests = v;
        }
        if let Some(v) = fields.extensions_count {
            row.extensions_count = v;
        }
        if let Some(v) = fields.opened_at {
            row.opened_at = v;
        }
        if let Some(v) = fields.last_failure_at {
            row.last_failure_at = v;
        }
        if let Some(v) = fields.last_success_at {
            row.last_success_at = v;
        }
        if let Some(v) = fields.last_state_change_at {
            row.last_state_change_at = v;
        }
        if let Some(v) = fields.config_snapshot {
            row.config_snapshot = v;
        }
        row.version += 1;
        Ok(true)
    }

    async fn list_circuits(
        &self,
        level: Option<CircuitLevel>,
        state: Option<CircuitState>,
    ) -> Result<Vec<CircuitBreakerRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .circuits
            .values()
            .filter(|c| level.map(|l| c.level == l).unwrap_or(true))
            .filter(|c| state.map(|s| c.state == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn record_circuit_event(&self, event: NewCircuitEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.circuit_events.push(CircuitBreakerEvent {
            id,
            circuit_id: event.circuit_id,
            run_id: event.run_id,
            event_type: event.event_type,
            from_state: event.from_state,
            to_state: event.to_state,
            error_context: event.error_context,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn list_circuit_events(
        &self,
        circuit_id: i64,
    ) -> Result<Vec<CircuitBreakerEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .circuit_events
            .iter()
            .filter(|e| e.circuit_id == circuit_id)
            .cloned()
            .collect())
    }

    async fn start_execution_run(&self, max_workers: i32) -> Result<ExecutionRun, StoreError> {
        let mut inner = self.inner.write().await;
        let run = ExecutionRun {
            id: Uuid::now_v7(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            max_workers,
            total_invocations: 0,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn complete_execution_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner.runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.status = status;
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_execution_run(&self, run_id: Uuid) -> Result<ExecutionRun, StoreError> {
        let inner = self.inner.read().await;
        inner.runs.get(&run_id).cloned().ok_or(StoreError::RunNotFound(run_id))
    }

    async fn current_execution_run(&self) -> Result<Option<ExecutionRun>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn list_execution_runs(&self) -> Result<Vec<ExecutionRun>, StoreError> {
        let inner = self.inner.read().await;
        let mut runs: Vec<ExecutionRun> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        Ok(runs)
    }

    async fn record_invocation(
        &self,
        run_id: Uuid,
        task_id: i64,
        stage: Stage,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_invocation_id += 1;
        let id = inner.next_invocation_id;
        inner.invocations.entry(run_id).or_default().push(Invocation {
            id,
            run_id,
            task_id,
            stage,
            started_at: Utc::now(),
        });
        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.total_invocations += 1;
        }
        Ok(())
    }

    async fn invocation_count(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.invocations.get(&run_id).map(|v| v.len() as i64).unwrap_or(0))
    }

    async fn get_config_int(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        let raw = inner.config.get(key).map(|s| s.as_str());
        Ok(parse_and_clamp(key, raw, default))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn log_stash_operation(
        &self,
        _task_id: i64,
        _operation: &str,
        _detail: serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn log_static_review_metric(
        &self,
        _task_id: i64,
        _metric: &str,
        _value: f64,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(key: &str, phase: i32, sequence: i32, depends_on: Vec<String>) -> NewTask {
        NewTask {
            task_key: key.to_string(),
            title: key.to_string(),
            goal: "goal".to_string(),
            phase,
            sequence,
            spec_id: None,
            test_file: None,
            impl_file: None,
            verify_command: None,
            done_criteria: None,
            acceptance_criteria: vec![],
            module_exports: vec![],
            depends_on,
        }
    }

    #[tokio::test]
    async fn claim_then_reclaim_after_expiry() {
        let store = InMemoryTaskStore::new();
        let task = store.insert_task(new_task("T-1", 0, 0, vec![])).await.unwrap();

        assert!(store.claim_task(task.id, "w1", -1).await.unwrap());
        let reclaimed = store.reclaim_stale().await.unwrap();
        assert_eq!(reclaimed, 1);

        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.claimed_by.is_none());
    }

    #[tokio::test]
    async fn only_one_of_two_concurrent_claims_wins() {
        let store = InMemoryTaskStore::new();
        let task = store.insert_task(new_task("T-1", 0, 0, vec![])).await.unwrap();

        let won_a = store.claim_task(task.id, "w1", 300).await.unwrap();
        let won_b = store.claim_task(task.id, "w2", 300).await.unwrap();

        assert!(won_a);
        assert!(!won_b);
    }

    #[tokio::test]
    async fn dependency_gate_blocks_until_satisfied() {
        let store = InMemoryTaskStore::new();
        let a = store.insert_task(new_task("A", 0, 0, vec![])).await.unwrap();
        store
            .insert_task(new_task("B", 0, 1, vec!["A".to_string()]))
            .await
            .unwrap();

        let ready = store.next_ready_task().await.unwrap().unwrap();
        assert_eq!(ready.task_key, "A");

        store.update_task_status(a.id, TaskStatus::Passing).await.unwrap();
        let ready = store.next_ready_task().await.unwrap().unwrap();
        assert_eq!(ready.task_key, "B");
    }

    #[tokio::test]
    async fn missing_dependency_blocks_indefinitely() {
        let store = InMemoryTaskStore::new();
        store
            .insert_task(new_task("B", 0, 0, vec!["GHOST".to_string()]))
            .await
            .unwrap();

        assert!(store.next_ready_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn circuit_update_fails_on_version_mismatch() {
        let store = InMemoryTaskStore::new();
        let circuit = store
            .create_circuit(CircuitLevel::Stage, "1:green", None, serde_json::json!({}))
            .await
            .unwrap();

        let ok = store
            .update_circuit(circuit.id, circuit.version, CircuitUpdate::new().with_failure_count(1))
            .await
            .unwrap();
        assert!(ok);

        // stale version now
        let stale = store
            .update_circuit(circuit.id, circuit.version, CircuitUpdate::new().with_failure_count(2))
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn attempt_numbers_are_dense() {
        let store = InMemoryTaskStore::new();
        let task = store.insert_task(new_task("T-1", 0, 0, vec![])).await.unwrap();
        for n in 1..=3 {
            store
                .record_attempt(NewAttempt {
                    task_id: task.id,
                    stage: Stage::Green,
                    attempt_number: n,
                    success: n == 3,
                    error_message: None,
                    exit_code: None,
                    output: None,
                })
                .await
                .unwrap();
        }
        let attempts = store.list_attempts(task.id).await.unwrap();
        let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn config_clamps_out_of_bounds() {
        let store = InMemoryTaskStore::new();
        store.set_config("max_green_attempts", "99").await.unwrap();
        let v = store.get_config_int("max_green_attempts", 2).await.unwrap();
        assert_eq!(v, 10);
    }
}
