//! System circuit: halts execution when a quorum of workers is
//! failing inside a sliding time window, guarding against e.g. an external API
//! outage. There is exactly one of these per run — see
//! [`crate::registry::CircuitRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orchestrator_store::{CircuitEventType, CircuitLevel, CircuitState, NewCircuitEvent, TaskStore};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::base::{CircuitHandle, CircuitUpdate};
use crate::config::SystemCircuitConfig;
use crate::error::CircuitError;

pub const SYSTEM_IDENTIFIER: &str = "system";

pub struct SystemCircuit {
    handle: CircuitHandle,
    config: SystemCircuitConfig,
    run_id: Option<Uuid>,
    /// Per-worker sliding window of failure timestamps, pruned on every read.
    failure_windows: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    in_flight: Mutex<HashSet<i64>>,
    total_workers: AtomicI64,
}

impl SystemCircuit {
    pub async fn load(
        store: Arc<dyn TaskStore>,
        run_id: Option<Uuid>,
        config: SystemCircuitConfig,
    ) -> Result<Self, CircuitError> {
        let snapshot = serde_json::to_value(&config).unwrap_or_default();
        let handle = CircuitHandle::load_or_create(
            store,
            CircuitLevel::System,
            SYSTEM_IDENTIFIER,
            run_id,
            snapshot,
        )
        .await?;
        Ok(Self {
            handle,
            config,
            run_id,
            failure_windows: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            total_workers: AtomicI64::new(0),
        })
    }

    /// Reassigned whenever the run reshapes the pool.
    pub fn set_total_workers(&self, n: i64) {
        self.total_workers.store(n, Ordering::SeqCst);
    }

    pub fn total_workers(&self) -> i64 {
        self.total_workers.load(Ordering::SeqCst)
    }

    pub async fn track_in_flight(&self, task_id: i64) {
        self.in_flight.lock().await.insert(task_id);
    }

    pub async fn untrack_in_flight(&self, task_id: i64) {
        self.in_flight.lock().await.remove(&task_id);
    }

    pub async fn state(&self) -> CircuitState {
        self.handle.snapshot().await.state
    }

    /// The full persisted row, for monitoring endpoints.
    pub async fn snapshot_row(&self) -> orchestrator_store::CircuitBreakerRow {
        self.handle.snapshot().await
    }

    /// `open` refuses new claims outright; `half_open` admits (it is itself the probe
    /// that determines recovery, evaluated on the next `record_success`/`should_halt`).
    pub async fn check_and_allow(&self) -> bool {
        !matches!(self.state().await, CircuitState::Open)
    }

    async fn prune_and_count_failing(&self) -> (usize, i64) {
        let now = Utc::now();
        let window = ChronoDuration::from_std(self.config.window).unwrap_or(ChronoDuration::zero());
        let mut windows = self.failure_windows.lock().await;
        windows.retain(|_, timestamps| {
            timestamps.retain(|t| now - *t <= window);
            !timestamps.is_empty()
        });
        (windows.len(), self.total_workers.load(Ordering::SeqCst))
    }

    /// Records a failure timestamp for `worker_id` and evaluates `should_halt`,
    /// tripping the circuit if the quorum threshold is crossed.
    pub async fn record_failure(
        &self,
        worker_id: &str,
    ) -> Result<bool, CircuitError> {
        {
            let mut windows = self.failure_windows.lock().await;
            windows.entry(worker_id.to_string()).or_default().push(Utc::now());
        }
        self.should_halt().await
    }

    pub async fn record_success(&self, worker_id: &str) -> Result<(), CircuitError> {
        self.failure_windows.lock().await.remove(worker_id);
        let mut guard = self.handle.row.lock().await;
        if guard.state == CircuitState::HalfOpen {
            let (failing, total) = self.prune_and_count_failing().await;
            let pct = failure_percentage(failing, total);
            if pct < self.config.failure_threshold_percent {
                let fields = CircuitUpdate::new()
                    .with_state(CircuitState::Closed)
                    .with_failure_count(0)
                    .with_last_success_at(Some(Utc::now()));
                let event = NewCircuitEvent {
                    circuit_id: guard.id,
                    run_id: self.run_id,
                    event_type: CircuitEventType::RecoverySucceeded,
                    from_state: Some(CircuitState::HalfOpen),
                    to_state: Some(CircuitState::Closed),
                    error_context: None,
                };
                self.handle.commit(&mut guard, fields, event).await?;
            }
        }
        Ok(())
    }

    /// `total_workers ≥ min_workers_for_threshold AND (failing/total)*100 ≥
    /// failure_threshold_percent`. Trips the circuit (capturing a snapshot) when true.
    pub async fn should_halt(&self) -> Result<bool, CircuitError> {
        let (failing, total) = self.prune_and_count_failing().await;
        if total < self.config.min_workers_for_threshold as i64 {
            return Ok(false);
        }
        let pct = failure_percentage(failing, total);
        let halt = pct >= self.config.failure_threshold_percent;
        if halt {
            self.trip(pct, failing, total).await?;
        }
        Ok(halt)
    }

    async fn trip(&self, failure_percentage: f64, failing: usize, total: i64) -> Result<(), CircuitError> {
        let mut guard = self.handle.row.lock().await;
        if guard.state == CircuitState::Open {
            return Ok(());
        }
        let in_flight: Vec<i64> = self.in_flight.lock().await.iter().copied().collect();
        let snapshot = json!({
            "timestamp": Utc::now(),
            "reason": "failure_threshold_exceeded",
            "failing_workers": failing,
            "total_workers": total,
            "failure_percentage": failure_percentage,
            "in_flight_task_ids": in_flight,
        });
        let from_state = guard.state;
        let fields = CircuitUpdate::new()
            .with_state(CircuitState::Open)
            .with_opened_at(Some(Utc::now()))
            .with_config_snapshot(snapshot.clone());
        let event = NewCircuitEvent {
            circuit_id: guard.id,
            run_id: self.run_id,
            event_type: CircuitEventType::ThresholdReached,
            from_state: Some(from_state),
            to_state: Some(CircuitState::Open),
            error_context: Some(snapshot),
        };
        self.handle.commit(&mut guard, fields, event).await?;
        Ok(())
    }

    /// Call periodically; transitions `open` → `half_open` once
    /// `auto_recovery_timeout` has elapsed, iff auto-recovery is enabled.
    pub async fn maybe_auto_recover(&self) -> Result<(), CircuitError> {
        if !self.config.auto_recovery_enabled {
            return Ok(());
        }
        let mut guard = self.handle.row.lock().await;
        if guard.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed_ok = match guard.opened_at {
            Some(opened_at) => {
                Utc::now() - opened_at
                    >= ChronoDuration::from_std(self.config.auto_recovery_timeout)
                        .unwrap_or(ChronoDuration::zero())
            }
            None => true,
        };
        if elapsed_ok {
            let fields = CircuitUpdate::new().with_state(CircuitState::HalfOpen);
            let event = NewCircuitEvent {
                circuit_id: guard.id,
                run_id: self.run_id,
                event_type: CircuitEventType::RecoveryStarted,
                from_state: Some(CircuitState::Open),
                to_state: Some(CircuitState::HalfOpen),
                error_context: None,
            };
            self.handle.commit(&mut guard, fields, event).await?;
        }
        Ok(())
    }

    pub async fn manual_reset(&self) -> Result<(), CircuitError> {
        self.failure_windows.lock().await.clear();
        let mut guard = self.handle.row.lock().await;
        let from_state = guard.state;
        let fields = CircuitUpdate::new()
            .with_state(CircuitState::Closed)
            .with_failure_count(0)
            .with_opened_at(None);
        let event = NewCircuitEvent {
            circuit_id: guard.id,
            run_id: self.run_id,
            event_type: CircuitEventType::ManualReset,
            from_state: Some(from_state),
            to_state: Some(CircuitState::Closed),
            error_context: None,
        };
        self.handle.commit(&mut guard, fields, event).await?;
        Ok(())
    }

    /// Polls until `in_flight` drains or `timeout` elapses; used by graceful
    /// shutdown. Returns `true` iff it drained before the deadline.
    pub async fn wait_for_in_flight(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.lock().await.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn failure_percentage(failing: usize, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        (failing as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_store::InMemoryTaskStore;

    async fn circuit(config: SystemCircuitConfig) -> SystemCircuit {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        SystemCircuit::load(store, None, config).await.unwrap()
    }

    #[tokio::test]
    async fn does_not_trip_below_min_workers() {
        let c = circuit(SystemCircuitConfig::default()).await;
        c.set_total_workers(1);
        assert!(!c.record_failure("w1").await.unwrap());
        assert_eq!(c.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn trips_at_threshold_percentage() {
        let c = circuit(
            SystemCircuitConfig::default()
                .with_min_workers_for_threshold(2)
                .with_failure_threshold_percent(50.0),
        )
        .await;
        c.set_total_workers(4);
        assert!(!c.record_failure("w1").await.unwrap());
        assert!(c.record_failure("w2").await.unwrap());
        assert_eq!(c.state().await, CircuitState::Open);
        let row = c.handle.snapshot().await;
        assert_eq!(row.config_snapshot["failure_percentage"], json!(50.0));
    }

    #[tokio::test]
    async fn wait_for_in_flight_drains() {
        let c = circuit(SystemCircuitConfig::default()).await;
        c.track_in_flight(1).await;
        let drained = tokio::time::timeout(Duration::from_millis(200), async {
            let c2 = &c;
            tokio::spawn(async move {});
            c2.untrack_in_flight(1).await;
            c2.wait_for_in_flight(Duration::from_millis(100)).await
        })
        .await
        .unwrap();
        assert!(drained);
    }
}
