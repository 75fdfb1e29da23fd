//! Stage circuit: prevents a single stage of a single task from
//! consuming unbounded retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use orchestrator_store::{CircuitEventType, CircuitLevel, CircuitState, NewCircuitEvent, Stage, TaskStore};
use uuid::Uuid;

use crate::base::{CircuitHandle, CircuitUpdate};
use crate::config::StageCircuitConfig;
use crate::error::CircuitError;

pub struct StageCircuit {
    handle: CircuitHandle,
    config: StageCircuitConfig,
    identifier: String,
    run_id: Option<Uuid>,
}

/// `"<task_id>:<stage>"`, the identifier scheme used to key the stage-circuit LRU in
/// [`crate::registry::CircuitRegistry`].
pub fn stage_identifier(task_id: i64, stage: Stage) -> String {
    format!("{task_id}:{stage}")
}

impl StageCircuit {
    pub async fn load(
        store: Arc<dyn TaskStore>,
        task_id: i64,
        stage: Stage,
        run_id: Option<Uuid>,
        config: StageCircuitConfig,
    ) -> Result<Self, CircuitError> {
        let identifier = stage_identifier(task_id, stage);
        let snapshot = serde_json::to_value(&config).unwrap_or_default();
        let handle =
            CircuitHandle::load_or_create(store, CircuitLevel::Stage, &identifier, run_id, snapshot)
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

    /// Re-reads state; in `closed` admits; in `open` self-transitions to `half_open`
    /// and admits iff the recovery window has elapsed, otherwise refuses; in
    /// `half_open` admits iff no probe request is already in flight.
    pub async fn check_and_allow(&self) -> Result<bool, CircuitError> {
        let mut guard = self.handle.row.lock().await;
        match guard.state {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
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
                    .with_half_open_requests(1);
                let won = self.handle.commit(&mut guard, fields, event).await?;
                if won {
                    Ok(true)
                } else {
                    // someone else already won the half-open transition; decide
                    // from the state that actually landed, don't retry the write.
                    Ok(decide_without_mutating(guard.state, guard.half_open_requests))
                }
            }
            CircuitState::HalfOpen => Ok(guard.half_open_requests == 0),
        }
    }

    pub async fn time_until_retry(&self) -> Option<Duration> {
        let guard = self.handle.snapshot().await;
        if guard.state != CircuitState::Open {
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
                let fields = CircuitUpdate::new()
                    .with_state(CircuitState::Closed)
                    .with_failure_count(0)
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
                let fields = CircuitUpdate::new()
                    .with_state(CircuitState::Open)
                    .with_half_open_requests(0)
                    .with_opened_at(Some(Utc::now()))
                    .with_last_failure_at(Some(Utc::now()));
                let event = NewCircuitEvent {
                    circuit_id: guard.id,
                    run_id: self.run_id,
                    event_type: CircuitEventType::RecoveryFailed,
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

/// Re-derives the `check_and_allow` decision from a state that was just
/// refreshed after a lost optimistic update, without attempting another write.
fn decide_without_mutating(state: CircuitState, half_open_requests: i32) -> bool {
    match state {
        CircuitState::Closed => true,
        CircuitState::HalfOpen => half_open_requests == 0,
        CircuitState::Open => false,
    }
}

pub(crate) fn recovery_window_elapsed(
    opened_at: Option<chrono::DateTime<Utc>>,
    recovery_timeout: Duration,
) -> bool {
    match opened_at {
        None => true,
        Some(opened_at) => {
            let elapsed = Utc::now() - opened_at;
            elapsed >= ChronoDuration::from_std(recovery_timeout).unwrap_or(ChronoDuration::zero())
        }
    }
}

pub(crate) fn time_remaining(
    opened_at: Option<chrono::DateTime<Utc>>,
    recovery_timeout: Duration,
) -> Option<Duration> {
    let opened_at = opened_at?;
    let deadline = opened_at
        + ChronoDuration::from_std(recovery_timeout).unwrap_or(ChronoDuration::zero());
    let remaining = deadline - Utc::now();
    remaining.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_store::InMemoryTaskStore;

    async fn store() -> Arc<dyn TaskStore> {
        Arc::new(InMemoryTaskStore::new())
    }

    #[tokio::test]
    async fn closed_circuit_allows_and_stays_closed_on_success() {
        let circuit = StageCircuit::load(
            store().await,
            1,
            Stage::Green,
            None,
            StageCircuitConfig::default(),
        )
        .await
        .unwrap();
        assert!(circuit.check_and_allow().await.unwrap());
        circuit.record_success().await.unwrap();
        assert_eq!(circuit.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_max_failures() {
        let circuit = StageCircuit::load(
            store().await,
            2,
            Stage::Green,
            None,
            StageCircuitConfig::default().with_max_failures(3),
        )
        .await
        .unwrap();
        for _ in 0..2 {
            circuit.record_failure(None).await.unwrap();
            assert_eq!(circuit.state().await, CircuitState::Closed);
        }
        circuit.record_failure(None).await.unwrap();
        assert_eq!(circuit.state().await, CircuitState::Open);
        assert!(!circuit.check_and_allow().await.unwrap());
    }

    #[tokio::test]
    async fn half_open_admits_one_and_recovers_on_success() {
        let circuit = StageCircuit::load(
            store().await,
            3,
            Stage::Green,
            None,
            StageCircuitConfig::default()
                .with_max_failures(1)
                .with_recovery_timeout(Duration::from_millis(0)),
        )
        .await
        .unwrap();
        circuit.record_failure(None).await.unwrap();
        assert_eq!(circuit.state().await, CircuitState::Open);
        assert!(circuit.check_and_allow().await.unwrap());
        assert_eq!(circuit.state().await, CircuitState::HalfOpen);
        // a second probe is refused while one is in flight
        assert!(!circuit.check_and_allow().await.unwrap());
        circuit.record_success().await.unwrap();
        assert_eq!(circuit.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let circuit = StageCircuit::load(
            store().await,
            4,
            Stage::Green,
            None,
            StageCircuitConfig::default()
                .with_max_failures(1)
                .with_recovery_timeout(Duration::from_millis(0)),
        )
        .await
        .unwrap();
        circuit.record_failure(None).await.unwrap();
        assert!(circuit.check_and_allow().await.unwrap());
        circuit.record_failure(None).await.unwrap();
        assert_eq!(circuit.state().await, CircuitState::Open);
    }
}
