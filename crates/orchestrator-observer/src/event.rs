use chrono::{DateTime, Utc};
use orchestrator_store::TaskStatus;
use serde::{Deserialize, Serialize};

/// One observed task-status transition. The snapshot the observer diffs is keyed
/// by `task_key` rather than the numeric row id, so that is what identifies the
/// task here too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub task_key: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}
