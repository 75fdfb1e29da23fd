//! Run coordinator: drives one end-to-end orchestration —
//! decomposition, worker-pool execution, and the observer→broadcaster bridge —
//! and owns the lifecycle of everything it wires up.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_broadcast::{BroadcastEvent, Broadcaster};
use orchestrator_circuits::{CircuitRegistry, StageCircuitConfig, SystemCircuitConfig, WorkerCircuitConfig};
use orchestrator_observer::{CallbackError, DbObserver, ObserverConfig, ObserverError, StatusChangeCallback, StatusChangeEvent};
use orchestrator_store::{RunStatus, TaskStore};
use orchestrator_worker::{GreenRetryConfig, PoolResult, StageExecutor, WorkerLoopConfig, WorkerPool, WorkerPoolConfig};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::decomposer::{DecomposeError, SpecDecomposer};
use crate::git::{GitCollaborator, GitError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("spec path not readable: {0}")]
    SpecUnreadable(String),

    #[error("workspace not writable: {0}")]
    WorkspaceUnwritable(String),

    #[error(transparent)]
    Decompose(#[from] DecomposeError),

    #[error(transparent)]
    Store(#[from] orchestrator_store::StoreError),

    #[error(transparent)]
    Worker(#[from] orchestrator_worker::WorkerError),

    #[error(transparent)]
    Circuit(#[from] orchestrator_circuits::CircuitError),

    #[error(transparent)]
    Observer(#[from] ObserverError),
}

/// Where a run stopped short of completion, surfaced on [`RunSummary`]: a
/// decomposition failure reports `stop_reached = Decompose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Decompose,
    Execution,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stop_reached: Option<StopReason>,
    pub pool_result: Option<PoolResult>,
}

/// Bridges the DB observer's status-change callback to the broadcaster, publishing
/// a `task_status_changed` [`BroadcastEvent`] for every transition. Errors are
/// isolated per-callback — a failed publish is logged here and never propagated
/// back to the observer tick.
struct ObserverBridge {
    broadcaster: Arc<Broadcaster>,
}

#[async_trait]
impl StatusChangeCallback for ObserverBridge {
    async fn on_change(&self, event: StatusChangeEvent) -> Result<(), CallbackError> {
        self.broadcaster
            .publish(BroadcastEvent::new(
                "task_status_changed",
                json!({
                    "task_key": event.task_key,
                    "old_status": event.old_status,
                    "new_status": event.new_status,
                    "timestamp": event.timestamp,
                }),
            ))
            .await;
        Ok(())
    }
}

pub struct RunCoordinatorConfig {
    pub max_workers: usize,
    pub run_refactor: bool,
    pub graceful_shutdown_timeout: std::time::Duration,
    pub pool_config: WorkerPoolConfig,
    pub loop_config: WorkerLoopConfig,
    pub green_config: GreenRetryConfig,
    pub stage_circuit_config: StageCircuitConfig,
    pub worker_circuit_config: WorkerCircuitConfig,
    pub system_circuit_config: SystemCircuitConfig,
    pub observer_config: ObserverConfig,
}

impl Default for RunCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            run_refactor: false,
            graceful_shutdown_timeout: std::time::Duration::from_secs(60),
            pool_config: WorkerPoolConfig::default(),
            loop_config: WorkerLoopConfig::default(),
            green_config: GreenRetryConfig::default(),
            stage_circuit_config: StageCircuitConfig::default(),
            worker_circuit_config: WorkerCircuitConfig::default(),
            system_circuit_config: SystemCircuitConfig::default(),
            observer_config: ObserverConfig::default(),
        }
    }
}

/// Drives a single execution run end-to-end. The `Broadcaster` is
/// shared with the HTTP surface and outlives any single run; only the `DbObserver`
/// is scoped to the run's lifetime.
pub struct RunCoordinator {
    store: Arc<dyn TaskStore>,
    decomposer: Arc<dyn SpecDecomposer>,
    executor: Arc<dyn StageExecutor>,
    git: Arc<dyn GitCollaborator>,
    broadcaster: Arc<Broadcaster>,
    config: RunCoordinatorConfig,
}

impl RunCoordinator {
    /// `broadcaster` is shared with the HTTP surface's `/events` subscribers —
    /// pass the same instance the API's `AppState` holds so the observer bridge's
    /// publishes reach SSE clients.
    pub fn new(
        store: Arc<dyn TaskStore>,
        decomposer: Arc<dyn SpecDecomposer>,
        executor: Arc<dyn StageExecutor>,
        git: Arc<dyn GitCollaborator>,
        broadcaster: Arc<Broadcaster>,
        config: RunCoordinatorConfig,
    ) -> Self {
        Self {
            store,
            decomposer,
            executor,
            git,
            broadcaster,
            config,
        }
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Preflight: spec path readable, workspace writable.
    fn validate_inputs(&self, spec_path: &str, workspace: &str) -> Result<(), CoordinatorError> {
        if !Path::new(spec_path).is_file() {
            return Err(CoordinatorError::SpecUnreadable(spec_path.to_string()));
        }
        let workspace = Path::new(workspace);
        if !workspace.is_dir() {
            return Err(CoordinatorError::WorkspaceUnwritable(format!(
                "{} is not a directory",
                workspace.display()
            )));
        }
        let probe = workspace.join(".orchestrator-write-probe");
        std::fs::write(&probe, b"").map_err(|e| {
            CoordinatorError::WorkspaceUnwritable(format!("{}: {e}", workspace.display()))
        })?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run(&self, spec_path: &str, workspace: &str) -> Result<RunSummary, CoordinatorError> {
        self.validate_inputs(spec_path, workspace)?;

        let run = self.store.start_execution_run(self.config.max_workers as i32).await?;
        let run_id = run.id;
        info!(%run_id, "execution run started");

        let tasks = match self.decomposer.decompose(spec_path).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(%run_id, error = %e, "decomposition failed, execution skipped");
                self.store.complete_execution_run(run_id, RunStatus::Failed).await?;
                return Ok(RunSummary {
                    run_id,
                    status: RunStatus::Failed,
                    stop_reached: Some(StopReason::Decompose),
                    pool_result: None,
                });
            }
        };
        for task in tasks {
            self.store.insert_task(task).await?;
        }

        let observer = DbObserver::new(self.store.clone(), self.config.observer_config);
        let bridge = Arc::new(ObserverBridge {
            broadcaster: self.broadcaster.clone(),
        });
        observer.start().await?;
        let callback_handle = observer.register_callback(bridge).await;

        let registry = Arc::new(CircuitRegistry::new(
            self.store.clone(),
            Some(run_id),
            self.config.stage_circuit_config.clone(),
            self.config.worker_circuit_config.clone(),
            self.config.system_circuit_config.clone(),
        ));
        let pool = WorkerPool::new(
            self.store.clone(),
            registry.clone(),
            self.executor.clone(),
            self.config.pool_config,
            self.config.loop_config,
            self.config.green_config,
            self.config.run_refactor,
            Some(run_id),
        );

        let pool_result = pool.run_all_phases().await;

        observer.unregister_callback(callback_handle).await;
        observer.stop().await;

        let (status, stop_reached, pool_result) = match pool_result {
            Ok(result) => {
                let status = if result.tasks_failed == 0 {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                };
                (status, None, Some(result))
            }
            Err(e) => {
                error!(%run_id, error = %e, "worker pool returned an error");
                (RunStatus::Failed, Some(StopReason::Execution), None)
            }
        };

        self.store.complete_execution_run(run_id, status).await?;

        if status == RunStatus::Completed {
            if let Err(GitError { message, .. }) = self.git.on_run_succeeded(run_id).await {
                // A Git/PR collaborator failure never retroactively fails an
                // already-completed run.
                warn!(%run_id, error = %message, "git/PR collaborator failed after successful run");
            }
        }

        Ok(RunSummary {
            run_id,
            status,
            stop_reached,
            pool_result,
        })
    }

    /// Cooperative shutdown: signals the system circuit's graceful path by simply
    /// waiting for in-flight work to drain via the pool's own cancellation — exposed
    /// so an HTTP handler or signal handler can trigger it independent of `run`.
    pub async fn graceful_shutdown(&self, pool: &WorkerPool) {
        pool.shutdown(self.config.graceful_shutdown_timeout).await.ok();
    }
}
