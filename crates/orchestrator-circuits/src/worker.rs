//! Worker circuit: pauses a worker that strings together consecutive
//! task failures. Differs from [`crate::stage::StageCircuit`] in that a failure while
//! half-open *extends* the pause rather than simply reopening it, and exhausting
//! `max_extensions` makes the circuit permanently open.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestrator_store::{CircuitEventType, CircuitLevel, CircuitState, NewCircuitEvent, TaskStore};
use uuid::Uuid;

use crate::base::{CircuitHandle, CircuitUpdate};
use crate::config::WorkerCircuitConfig;
use crate::error::CircuitError;
use crate::stage::{recovery_window_elapsed, time_remaining};

pub struct WorkerCircuit {
    handle: CircuitHandle,
    config: WorkerCircuitConfig,
    identifier: String,
    run_id: Option<Uuid>,
}

pub fn worker_identifier(worker_id: &str) -> String {
    format!("worker_{worker_id}")
}

impl WorkerCircuit {
    pub async fn load(
        store: Arc<dyn TaskStore>,
        worker_id: &str,
        run_id: Option<Uuid>,
        config: WorkerCircuitConfig,
    ) -> Result<Self, CircuitError> {
        let identifier = worker_identifier(worker_id);
        let snapshot = serde_json::to_value(&config).unwrap_or_default();
        let handle =
            CircuitHandle::load_or_create(store, CircuitLevel::Worker, &identifier, run_id, snapshot)
                .await?;
        Ok(Self {
            handle,
            config,
            identifier,
            run_id,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn state(&self) -> CircuitState {
        self.handle.snapshot().await.state
    }

    /// The full persisted row, for monitoring endpoints.
    pub async fn snapshot_row(&self) -> orchestrator_store::CircuitBreakerRow {
        self.handle.snapshot().await
    }

    pub async fn is_permanently_open(&self) -> bool {
        let row = self.handle.snapshot().await;
        row.state == CircuitState::Open && row.extensions_count >= self.config.max_extensions
    }

    pub async fn check_and_allow(&self) -> Result<bool, CircuitError> {
        let mut guard = self.handle.row.lock().await;
        match guard.state {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
                if guard.extensions_count >= self.config.max_extensions {
                    return Ok(false);
                }
                if !recovery_window_elapsed(guard.opened_at, self.config.recovery_timeout) {
                    return Ok(false);
                }
                let event = NewCircuitEvent {
                    circuit_id: guard.id,
                    run_id: self.run_id,
                    event_type: CircuitEventType::RecoveryStarted,
                    from_state: Some(CircuitState::Open),
                    to_state: Some(CircuitState::HalfOpen),
                    error_context: None,
                };
                let fields = CircuitUpdate::new()
                    .with_state(CircuitState::HalfOpen)
                    .with_half_open_requests(1)
                    .with_success_count(0);
                let won = self.handle.commit(&mut guard, fields, event).await?;
                if won {
                    Ok(true)
                } else {
                    // someone else already won the half-open transition; decide
                    // from the state that actually landed, don't retry the write.
                    Ok(matches!(guard.state, CircuitState::Closed)
                        || (guard.state == CircuitState::HalfOpen
                            && guard.half_open_requests < self.config.half_open_max_requests))
                }
            }
            CircuitState::HalfOpen => {
                Ok(guard.half_open_requests < self.config.half_open_max_requests)
            }
        }
    }

    pub async fn time_until_retry(&self) -> Option<Duration> {
        let guard = self.handle.snapshot().await;
        if guard.state != CircuitState::Open || guard.extensions_count >= self.config.max_extensions {
            return None;
        }
        time_remaining(guard.opened_at, self.config.recovery_timeout)
    }

    pub async fn record_success(&self) -> Result<(), CircuitError> {
        let mut guard = self.handle.row.lock().await;
        match guard.state {
            CircuitState::Closed => {
                let fields = CircuitUpdate::new()
                    .with_failure_count(0)
                    .with_success_count(guard.success_count + 1)
                    .with_last_success_at(Some(Utc::now()));
                let event = NewCircuitEvent {
                    circuit_id: guard.id,
                    run_id: self.run_id,
                    event_type: CircuitEventType::SuccessRecorded,
                    from_state: Some(CircuitState::Closed),
                    to_state: Some(CircuitState::Closed),
                    error_context: None,
                };
                self.handle.commit(&mut guard, fields, event).await?;
                Ok(())
            }
            CircuitState::HalfOpen => {
                // threshold-based, unlike the stage circuit's immediate close
                let successes = guard.success_count + 1;
                if successes >= self.config.success_threshold {
                    let fields = CircuitUpdate::new()
                        .with_state(CircuitState::Closed)
                        .with_failure_count(0)
                        .with_success_count(0)
                        .with_extensions_count(0)
                        .with_half_open_requests(0)
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
                } else {
                    let fields = CircuitUpdate::new()
                        .with_success_count(successes)
                        .with_last_success_at(Some(Utc::now()));
                    let event = NewCircuitEvent {
                        circuit_id: guard.id,
                        run_id: self.run_id,
                        event_type: CircuitEventType::SuccessRecorded,
                        from_state: Some(CircuitState::HalfOpen),
                        to_state: Some(CircuitState::HalfOpen),
                        error_context: None,
                    };
                    self.handle.commit(&mut guard, fields, event).await?;
                }
                Ok(())
            }
            CircuitState::Open => Ok(()),
        }
    }

    pub async fn record_failure(
        &self,
        error_context: Option<serde_json::Value>,
    ) -> Result<(), CircuitError> {
        let mut guard = self.handle.row.lock().await;
        match guard.state {
            CircuitState::Closed => {
                let failures = guard.failure_count + 1;
                if failures >= self.config.max_failures {
                    let fields = CircuitUpdate::new()
                        .with_state(CircuitState::Open)
                        .with_failure_count(failures)
                        .with_opened_at(Some(Utc::now()))
                        .with_last_failure_at(Some(Utc::now()));
                    let event = NewCircuitEvent {
                        circuit_id: guard.id,
                        run_id: self.run_id,
                        event_type: CircuitEventType::ThresholdReached,
                        from_state: Some(CircuitState::Closed),
                        to_state: Some(CircuitState::Open),
                        error_context,
                    };
                    self.handle.commit(&mut guard, fields, event).await?;
                    Ok(())
                } else {
                    let fields = CircuitUpdate::new()
                        .with_failure_count(failures)
                        .with_last_failure_at(Some(Utc::now()));
                    let event = NewCircuitEvent {
                        circuit_id: guard.id,
                        run_id: self.run_id,
                        event_type: CircuitEventType::FailureRecorded,
                        from_state: Some(CircuitState::Closed),
                        to_state: Some(CircuitState::Closed),
                        error_context,
                    };
                    self.handle.commit(&mut guard, fields, event).await?;
                    Ok(())
                }
            }
            CircuitState::HalfOpen => {
                // extend the pause rather than simply reopening
                let extensions = guard.extensions_count + 1;
                let fields = CircuitUpdate::new()
                    .with_state(CircuitState::Open)
                    .with_extensions_count(extensions)
                    .with_half_open_requests(0)
                    .with_success_count(0)
                    .with_opened_at(Some(Utc::now()))
                    .with_last_failure_at(Some(Utc::now()));
                let event = NewCircuitEvent {
                    circuit_id: guard.id,
                    run_id: self.run_id,
                    event_type: CircuitEventType::ExtensionApplied,
                    from_state: Some(CircuitState::HalfOpen),
                    to_state: Some(CircuitState::Open),
                    error_context,
                };
                self.handle.commit(&mut guard, fields, event).await?;
                Ok(())
            }
            CircuitState::Open => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_store::InMemoryTaskStore;

    async fn store() -> Arc<dyn TaskStore> {
        Arc::new(InMemoryTaskStore::new())
    }

    #[tokio::test]
    async fn extension_count_climbs_and_eventually_permanently_opens() {
        let config = WorkerCircuitConfig::default()
            .with_max_failures(1)
            .with_max_extensions(2)
            .with_recovery_timeout(Duration::from_millis(0));
        let circuit = WorkerCircuit::load(store().await, "w1", None, config)
            .await
            .unwrap();

        circuit.record_failure(None).await.unwrap(); // closed -> open, extensions=0
        assert!(circuit.check_and_allow().await.unwrap()); // open -> half_open
        circuit.record_failure(None).await.unwrap(); // half_open -> open, extensions=1
        assert!(!circuit.is_permanently_open().await);

        assert!(circuit.check_and_allow().await.unwrap()); // open -> half_open again
        circuit.record_failure(None).await.unwrap(); // half_open -> open, extensions=2
        assert!(circuit.is_permanently_open().await);
        assert!(!circuit.check_and_allow().await.unwrap());
    }

    #[tokio::test]
    async fn recovery_resets_extensions() {
        let config = WorkerCircuitConfig::default()
            .with_max_failures(1)
            .with_recovery_timeout(Duration::from_millis(0));
        let circuit = WorkerCircuit::load(store().await, "w2", None, config)
            .await
            .unwrap();
        circuit.record_failure(None).await.unwrap();
        assert!(circuit.check_and_allow().await.unwrap());
        circuit.record_failure(None).await.unwrap();
        assert!(circuit.check_and_allow().await.unwrap());
        circuit.record_success().await.unwrap();
        assert_eq!(circuit.state().await, CircuitState::Closed);
        assert_eq!(circuit.handle.snapshot().await.extensions_count, 0);
    }
}
