//! Shared application state handed to every axum handler.

use std::sync::Arc;

use orchestrator_broadcast::Broadcaster;
use orchestrator_circuits::CircuitRegistry;
use orchestrator_store::TaskStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub circuits: Arc<CircuitRegistry>,
    pub broadcaster: Arc<Broadcaster>,
}

impl AppState {
    pub fn new(store: Arc<dyn TaskStore>, circuits: Arc<CircuitRegistry>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            store,
            circuits,
            broadcaster,
        }
    }
}
