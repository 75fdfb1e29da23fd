//! Worker pool: spawns `max_workers` workers, runs a stale-claim
//! reaper, and watches for the pool to drain (no ready or in-flight tasks left).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orchestrator_circuits::CircuitRegistry;
use orchestrator_store::TaskStore;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{GreenRetryConfig, WorkerLoopConfig, WorkerPoolConfig};
use crate::error::WorkerError;
use crate::executor::StageExecutor;
use crate::worker::{Worker, WorkerStats};

/// Summary of one `run_all_phases` invocation.
#[derive(Debug, Clone, Default)]
pub struct PoolResult {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_invocations: u64,
    pub worker_stats: Vec<WorkerStats>,
}

fn log_join_results(results: Vec<Result<Result<(), WorkerError>, tokio::task::JoinError>>) {
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker loop returned an error"),
            Err(e) => error!(error = %e, "worker task panicked"),
        }
    }
}

pub struct WorkerPool {
    store: Arc<dyn TaskStore>,
    registry: Arc<CircuitRegistry>,
    executor: Arc<dyn StageExecutor>,
    pool_config: WorkerPoolConfig,
    loop_config: WorkerLoopConfig,
    green_config: GreenRetryConfig,
    run_refactor: bool,
    run_id: Option<Uuid>,
    shutdown_tx: OnceCell<watch::Sender<bool>>,
    /// Populated once `run_all_phases` spawns workers, so [`WorkerPool::shutdown`]
    /// can await them from a different task than the one driving `run_all_phases`.
    worker_handles: Mutex<Vec<JoinHandle<Result<(), WorkerError>>>>,
    spawned: AtomicU64,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<CircuitRegistry>,
        executor: Arc<dyn StageExecutor>,
        pool_config: WorkerPoolConfig,
        loop_config: WorkerLoopConfig,
        green_config: GreenRetryConfig,
        run_refactor: bool,
        run_id: Option<Uuid>,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            pool_config,
            loop_config,
            green_config,
            run_refactor,
            run_id,
            shutdown_tx: OnceCell::new(),
            worker_handles: Mutex::new(Vec::new()),
            spawned: AtomicU64::new(0),
        }
    }

    /// Signals every worker to finish its current task and stop (cooperative
    /// cancellation). Safe to call before `run_all_phases` returns,
    /// from a different task — e.g. the run coordinator's graceful-shutdown path.
    pub fn cancel(&self) {
        if let Some(tx) = self.shutdown_tx.get() {
            let _ = tx.send(true);
        }
    }

    /// Graceful shutdown: signals cancellation, waits up to
    /// `deadline` for every worker to drain its current task, and on timeout
    /// force-reclaims any claims still outstanding. Safe to call concurrently with
    /// `run_all_phases` — whichever call observes the handles first joins them;
    /// the other sees an already-drained pool and returns immediately.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), WorkerError> {
        self.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.worker_handles.lock().await);
        if handles.is_empty() {
            return Ok(());
        }
        let joined = tokio::time::timeout(deadline, futures::future::join_all(handles)).await;
        match joined {
            Ok(results) => log_join_results(results),
            Err(_) => {
                warn!("graceful shutdown deadline exceeded, force-reclaiming stale claims");
                let reclaimed = self.store.reclaim_stale().await?;
                if reclaimed > 0 {
                    warn!(reclaimed, "force-reclaimed claims after shutdown timeout");
                }
            }
        }
        Ok(())
    }

    /// Spawns the pool, waits for every worker to drain, and returns a summary.
    #[instrument(skip(self))]
    pub async fn run_all_phases(&self) -> Result<PoolResult, WorkerError> {
        self.registry
            .get_system_circuit()
            .await?
            .set_total_workers(self.pool_config.max_workers as i64);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _ = self.shutdown_tx.set(shutdown_tx.clone());

        let mut workers = Vec::with_capacity(self.pool_config.max_workers);
        let mut handles = Vec::with_capacity(self.pool_config.max_workers);
        for _ in 0..self.pool_config.max_workers {
            let index = self.spawned.fetch_add(1, Ordering::SeqCst);
            let worker_id = match self.run_id {
                Some(run_id) => format!("worker-{run_id}-{index}"),
                None => format!("worker-{index}"),
            };
            let worker = Arc::new(Worker::new(
                worker_id,
                self.store.clone(),
                self.registry.clone(),
                self.executor.clone(),
                self.loop_config,
                self.green_config,
                self.run_refactor,
                self.run_id,
            ));
            let rx = shutdown_rx.clone();
            let spawned_worker = worker.clone();
            handles.push(tokio::spawn(
                async move { spawned_worker.run(rx).await },
            ));
            workers.push(worker);
        }

        *self.worker_handles.lock().await = handles;

        let reaper = self.spawn_reaper(shutdown_rx.clone());
        let drain_watcher = self.spawn_drain_watcher(shutdown_tx.clone(), shutdown_rx.clone());

        // `shutdown` may have already taken and joined these handles concurrently;
        // in that case this is an empty vec and the loop below is a no-op.
        let remaining: Vec<_> = std::mem::take(&mut *self.worker_handles.lock().await);
        log_join_results(futures::future::join_all(remaining).await);

        let _ = shutdown_tx.send(true);
        reaper.abort();
        drain_watcher.abort();

        let worker_stats: Vec<WorkerStats> = workers.iter().map(|w| w.stats()).collect();
        let tasks_completed = worker_stats.iter().map(|s| s.tasks_completed).sum();
        let tasks_failed = worker_stats.iter().map(|s| s.tasks_failed).sum();
        let total_invocations = worker_stats.iter().map(|s| s.invocations).sum();

        info!(
            tasks_completed,
            tasks_failed, total_invocations, "worker pool drained"
        );

        Ok(PoolResult {
            tasks_completed,
            tasks_failed,
            total_invocations,
            worker_stats,
        })
    }

    fn spawn_reaper(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.pool_config.reaper_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                match store.reclaim_stale().await {
                    Ok(n) if n > 0 => info!(reclaimed = n, "reclaimed stale claims"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "reclaim_stale failed"),
                }
            }
        })
    }

    /// Watches `Store::task_stats` and signals shutdown once nothing is pending or
    /// in flight — the pool's definition of "drained" absent an explicit
    /// cancellation.
    fn spawn_drain_watcher(
        &self,
        shutdown_tx: watch::Sender<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.loop_config.idle_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
                match store.task_stats().await {
                    Ok(stats) if stats.pending == 0 && stats.running == 0 => {
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "task_stats failed in drain watcher"),
                }
            }
        })
    }
}
