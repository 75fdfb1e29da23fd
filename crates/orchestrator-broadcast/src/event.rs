use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A generic envelope published to every current subscriber. The
/// run coordinator's observer bridge publishes `event_type: "task_status_changed"`;
/// other collaborators may publish their own types through the same channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
