//! Circuit registry: lazily instantiates and caches circuit instances,
//! and owns the single per-run system circuit.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use orchestrator_store::{CircuitBreakerRow, Stage, TaskStore};
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::config::{StageCircuitConfig, SystemCircuitConfig, WorkerCircuitConfig};
use crate::error::CircuitError;
use crate::stage::{stage_identifier, StageCircuit};
use crate::system::SystemCircuit;
use crate::worker::{worker_identifier, WorkerCircuit};

/// Bound on the stage-circuit LRU: open-ended task counts require
/// bounded memory; the persisted row in the store is the source of truth, so
/// eviction is safe regardless of current circuit state.
const STAGE_CACHE_CAPACITY: usize = 1000;

pub struct CircuitRegistry {
    store: Arc<dyn TaskStore>,
    run_id: Option<Uuid>,
    stage_config: StageCircuitConfig,
    worker_config: WorkerCircuitConfig,
    system_config: SystemCircuitConfig,
    stage_cache: Mutex<LruCache<String, Arc<StageCircuit>>>,
    worker_cache: Mutex<std::collections::HashMap<String, Arc<WorkerCircuit>>>,
    system: OnceCell<Arc<SystemCircuit>>,
}

impl CircuitRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        run_id: Option<Uuid>,
        stage_config: StageCircuitConfig,
        worker_config: WorkerCircuitConfig,
        system_config: SystemCircuitConfig,
    ) -> Self {
        Self {
            store,
            run_id,
            stage_config,
            worker_config,
            system_config,
            stage_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(STAGE_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            worker_cache: Mutex::new(std::collections::HashMap::new()),
            system: OnceCell::new(),
        }
    }

    pub async fn get_stage_circuit(
        &self,
        task_id: i64,
        stage: Stage,
    ) -> Result<Arc<StageCircuit>, CircuitError> {
        let key = stage_identifier(task_id, stage);
        let mut cache = self.stage_cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }
        let circuit = Arc::new(
            StageCircuit::load(
                self.store.clone(),
                task_id,
                stage,
                self.run_id,
                self.stage_config.clone(),
            )
            .await?,
        );
        cache.put(key, circuit.clone());
        Ok(circuit)
    }

    pub async fn get_worker_circuit(
        &self,
        worker_id: &str,
    ) -> Result<Arc<WorkerCircuit>, CircuitError> {
        let key = worker_identifier(worker_id);
        let mut cache = self.worker_cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }
        let circuit = Arc::new(
            WorkerCircuit::load(
                self.store.clone(),
                worker_id,
                self.run_id,
                self.worker_config.clone(),
            )
            .await?,
        );
        cache.insert(key, circuit.clone());
        Ok(circuit)
    }

    /// The system circuit is instantiated on first access and is a singleton for
    /// the life of the registry.
    pub async fn get_system_circuit(&self) -> Result<Arc<SystemCircuit>, CircuitError> {
        self.system
            .get_or_try_init(|| async {
                Ok::<_, CircuitError>(Arc::new(
                    SystemCircuit::load(self.store.clone(), self.run_id, self.system_config.clone())
                        .await?,
                ))
            })
            .await
            .map(|c| c.clone())
    }

    /// Evicts stage-circuit cache entries for `task_ids`; their persisted rows in
    /// the store are untouched.
    pub async fn cleanup_completed_tasks(&self, task_ids: &[i64]) {
        let mut cache = self.stage_cache.lock().await;
        for stage in [
            Stage::Red,
            Stage::Green,
            Stage::Verify,
            Stage::Fix,
            Stage::Refactor,
            Stage::ReVerify,
            Stage::Commit,
        ] {
            for task_id in task_ids {
                cache.pop(&stage_identifier(*task_id, stage));
            }
        }
    }

    /// Every cached circuit not in `closed` state, used by monitoring endpoints.
    /// Evicted entries are not reconsulted here — callers that need
    /// the full persisted picture should query the store's `circuit_breakers` table
    /// directly.
    pub async fn get_all_open_circuits(&self) -> Vec<CircuitBreakerRow> {
        use orchestrator_store::CircuitState;

        let mut open = Vec::new();
        let stage_rows = {
            let cache = self.stage_cache.lock().await;
            let mut rows = Vec::new();
            for (_, circuit) in cache.iter() {
                rows.push(circuit.clone());
            }
            rows
        };
        for circuit in stage_rows {
            if circuit.state().await != CircuitState::Closed {
                open.push(circuit.snapshot_row().await);
            }
        }

        let worker_rows = {
            let cache = self.worker_cache.lock().await;
            cache.values().cloned().collect::<Vec<_>>()
        };
        for circuit in worker_rows {
            if circuit.state().await != CircuitState::Closed {
                open.push(circuit.snapshot_row().await);
            }
        }

        if let Some(system) = self.system.get() {
            if system.state().await != CircuitState::Closed {
                open.push(system.snapshot_row().await);
            }
        }

        open
    }
}
