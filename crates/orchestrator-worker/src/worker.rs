//! A single worker actor: claim → run pipeline stages via the
//! external executor → update state → release. Consults the circuit registry
//! before every stage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use orchestrator_circuits::CircuitRegistry;
use orchestrator_store::{
    ClaimOutcome, CircuitState, NewAttempt, Stage, Task, TaskStatus, TaskStore,
};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{GreenRetryConfig, WorkerLoopConfig};
use crate::error::WorkerError;
use crate::executor::{StageExecutor, StageRequest};
use crate::green::run_green_retry_loop;

/// Per-worker counters reported by [`crate::pool::WorkerPool::run_all_phases`].
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub worker_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub invocations: u64,
}

/// Terminal result of running one claimed task through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineOutcome {
    Completed,
    /// A stage circuit opened or a pre-existing open circuit refused the stage;
    /// the task was marked `blocked`.
    Blocked,
    Failed,
    Cancelled,
}

/// A single concurrent actor claiming and driving tasks through RED → GREEN →
/// VERIFY → (FIX) → (REFACTOR).
pub struct Worker {
    id: String,
    store: Arc<dyn TaskStore>,
    registry: Arc<CircuitRegistry>,
    executor: Arc<dyn StageExecutor>,
    loop_config: WorkerLoopConfig,
    green_config: GreenRetryConfig,
    run_refactor: bool,
    run_id: Option<Uuid>,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    invocations: AtomicU64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        registry: Arc<CircuitRegistry>,
        executor: Arc<dyn StageExecutor>,
        loop_config: WorkerLoopConfig,
        green_config: GreenRetryConfig,
        run_refactor: bool,
        run_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            registry,
            executor,
            loop_config,
            green_config,
            run_refactor,
            run_id,
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            invocations: self.invocations.load(Ordering::SeqCst),
        }
    }

    /// Runs until `cancel` observes a shutdown signal. Cooperative: the signal is
    /// checked at every stage boundary.
    #[instrument(skip(self, cancel), fields(worker_id = %self.id))]
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.store.register_worker(&self.id).await?;

        loop {
            if *cancel.borrow() {
                break;
            }

            let worker_circuit = self.registry.get_worker_circuit(&self.id).await?;
            let system_circuit = self.registry.get_system_circuit().await?;

            if !system_circuit.check_and_allow().await || !worker_circuit.check_and_allow().await? {
                if self.sleep_or_cancel(&mut cancel).await {
                    break;
                }
                continue;
            }

            let Some(task) = self.claim_next_task().await? else {
                if self.sleep_or_cancel(&mut cancel).await {
                    break;
                }
                continue;
            };

            system_circuit.track_in_flight(task.id).await;
            self.store
                .worker_heartbeat(&self.id, Some(task.id))
                .await?;

            let outcome = self.run_pipeline(&task, &mut cancel).await?;
            system_circuit.untrack_in_flight(task.id).await;

            match outcome {
                PipelineOutcome::Completed => {
                    self.tasks_completed.fetch_add(1, Ordering::SeqCst);
                    self.store
                        .release_task(task.id, &self.id, ClaimOutcome::Completed)
                        .await?;
                    worker_circuit.record_success().await?;
                    system_circuit.record_success(&self.id).await?;
                    self.registry.cleanup_completed_tasks(&[task.id]).await;
                }
                PipelineOutcome::Blocked => {
                    self.store
                        .release_task(task.id, &self.id, ClaimOutcome::Failed)
                        .await?;
                }
                PipelineOutcome::Failed => {
                    self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                    self.store
                        .release_task(task.id, &self.id, ClaimOutcome::Failed)
                        .await?;
                    worker_circuit.record_failure(None).await?;
                    system_circuit.record_failure(&self.id).await?;
                }
                PipelineOutcome::Cancelled => {
                    self.store
                        .release_task(task.id, &self.id, ClaimOutcome::Released)
                        .await?;
                    break;
                }
            }
        }

        self.store.deregister_worker(&self.id).await?;
        Ok(())
    }

    /// Sleeps for the idle-poll interval, or returns early (and reports whether the
    /// loop should terminate) if cancellation fires first.
    async fn sleep_or_cancel(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.loop_config.idle_poll_interval) => false,
            changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
        }
    }

    /// C2: ask for the next ready task and attempt to claim it; on a lost race,
    /// try again — the loser's candidate is no longer ready once the winner's
    /// claim lands, so the next query surfaces a fresh candidate (or none).
    async fn claim_next_task(&self) -> Result<Option<Task>, WorkerError> {
        const MAX_RACE_RETRIES: u32 = 16;
        for _ in 0..MAX_RACE_RETRIES {
            let Some(candidate) = self.store.next_ready_task().await? else {
                return Ok(None);
            };
            let lease_seconds = self.loop_config.claim_lease.as_secs() as i64;
            if self
                .store
                .claim_task(candidate.id, &self.id, lease_seconds)
                .await?
            {
                return Ok(Some(self.store.get_task(candidate.id).await?));
            }
        }
        Ok(None)
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PipelineOutcome, WorkerError> {
        self.store
            .update_task_status(task.id, TaskStatus::InProgress)
            .await?;

        for stage in [Stage::Red, Stage::Green, Stage::Verify] {
            if *cancel.borrow() {
                return Ok(PipelineOutcome::Cancelled);
            }

            let stage_circuit = self.registry.get_stage_circuit(task.id, stage).await?;
            if !stage_circuit.check_and_allow().await? {
                info!(task_id = task.id, %stage, "stage circuit open, blocking task");
                self.store
                    .update_task_status(task.id, TaskStatus::Blocked)
                    .await?;
                return Ok(PipelineOutcome::Blocked);
            }

            let result = if stage == Stage::Green {
                run_green_retry_loop(&self.store, &self.executor, task, self.green_config).await?
            } else {
                self.invoke_once(task, stage).await?
            };

            if result.success {
                stage_circuit.record_success().await?;
                if stage == Stage::Green {
                    self.store
                        .update_task_status(task.id, TaskStatus::Passing)
                        .await?;
                }
                continue;
            }

            stage_circuit
                .record_failure(result.error.clone().map(|e| json!({ "error": e })))
                .await?;
            if stage_circuit.state().await == CircuitState::Open {
                self.store
                    .update_task_status(task.id, TaskStatus::Blocked)
                    .await?;
                return Ok(PipelineOutcome::Blocked);
            }

            if stage != Stage::Verify {
                return Ok(PipelineOutcome::Failed);
            }

            if !self.run_fix_and_reverify(task, cancel).await? {
                return Ok(PipelineOutcome::Failed);
            }
        }

        if self.run_refactor {
            // REFACTOR failures are recorded but never block completion.
            if let Err(e) = self.invoke_once(task, Stage::Refactor).await {
                warn!(task_id = task.id, error = %e, "refactor stage failed, continuing");
            }
        }

        self.store
            .update_task_status(task.id, TaskStatus::Complete)
            .await?;
        Ok(PipelineOutcome::Completed)
    }

    async fn run_fix_and_reverify(
        &self,
        task: &Task,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool, WorkerError> {
        if *cancel.borrow() {
            return Ok(false);
        }
        let stage_circuit = self.registry.get_stage_circuit(task.id, Stage::Fix).await?;
        if !stage_circuit.check_and_allow().await? {
            self.store
                .update_task_status(task.id, TaskStatus::Blocked)
                .await?;
            return Ok(false);
        }

        let fix_result = self.invoke_once(task, Stage::Fix).await?;
        if !fix_result.success {
            stage_circuit
                .record_failure(fix_result.error.clone().map(|e| json!({ "error": e })))
                .await?;
            return Ok(false);
        }
        stage_circuit.record_success().await?;

        let reverify = self.invoke_once(task, Stage::ReVerify).await?;
        Ok(reverify.success)
    }

    async fn invoke_once(
        &self,
        task: &Task,
        stage: Stage,
    ) -> Result<crate::executor::StageResult, WorkerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(run_id) = self.run_id {
            self.store.record_invocation(run_id, task.id, stage).await?;
        }
        let result = self
            .executor
            .execute(StageRequest {
                task: task.clone(),
                stage,
                previous_failure: None,
            })
            .await;
        self.store
            .record_attempt(NewAttempt {
                task_id: task.id,
                stage,
                attempt_number: 1,
                success: result.success,
                error_message: result.error.clone(),
                exit_code: result.exit_code,
                output: result.output.clone(),
            })
            .await?;
        Ok(result)
    }
}
