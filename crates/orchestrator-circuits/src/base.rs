//! Shared persistence plumbing for the three circuit variants: a tagged variant
//! over a shared base record, with trip/recover predicates implemented per variant.

use std::sync::Arc;

use orchestrator_store::{CircuitBreakerRow, CircuitLevel, NewCircuitEvent, TaskStore};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::CircuitError;

pub use orchestrator_store::store::CircuitUpdate;

/// The persisted row plus the per-instance mutex that totally orders state
/// transitions within one process. Cross-instance races are resolved by
/// the row's `version` column via [`TaskStore::update_circuit`].
pub(crate) struct CircuitHandle {
    store: Arc<dyn TaskStore>,
    pub(crate) row: Mutex<CircuitBreakerRow>,
}

impl CircuitHandle {
    pub(crate) async fn load_or_create(
        store: Arc<dyn TaskStore>,
        level: CircuitLevel,
        identifier: &str,
        run_id: Option<Uuid>,
        config_snapshot: serde_json::Value,
    ) -> Result<Self, CircuitError> {
        let row = match store.get_circuit(level, identifier).await? {
            Some(row) => row,
            None => {
                store
                    .create_circuit(level, identifier, run_id, config_snapshot)
                    .await?
            }
        };
        Ok(Self {
            store,
            row: Mutex::new(row),
        })
    }

    pub(crate) async fn snapshot(&self) -> CircuitBreakerRow {
        self.row.lock().await.clone()
    }

    /// Apply an optimistic update against `guard`'s cached version. Always refreshes
    /// `guard` from the store afterward. Returns `Ok(true)` if this call's update won
    /// the race (the transition event is recorded) or `Ok(false)` on a lost update —
    /// a lost update is logged, never returned as an error; the caller observes the
    /// refreshed `guard` and decides from the state that actually won, rather than
    /// retrying the write in a loop.
    pub(crate) async fn commit(
        &self,
        guard: &mut CircuitBreakerRow,
        fields: CircuitUpdate,
        event: NewCircuitEvent,
    ) -> Result<bool, CircuitError> {
        let won = self
            .store
            .update_circuit(guard.id, guard.version, fields)
            .await?;
        let fresh = self.store.get_circuit_by_id(guard.id).await?;
        *guard = fresh;
        if !won {
            warn!(circuit_id = guard.id, "lost optimistic update, refreshed from winning row");
            return Ok(false);
        }
        self.store.record_circuit_event(event).await?;
        Ok(true)
    }
}
