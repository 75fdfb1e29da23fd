//! Tunables for the GREEN retry loop, the per-worker run loop, and the pool
//! reaper. The bounds themselves are enforced on the `Store` side via
//! [`orchestrator_store::config`] — these structs carry the clamped values once read.

use std::time::Duration;

/// Parameters for the GREEN retry loop, already clamped against
/// [`orchestrator_store::config::CONFIG_BOUNDS`].
#[derive(Debug, Clone, Copy)]
pub struct GreenRetryConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_time: Duration,
}

impl Default for GreenRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_delay: Duration::from_millis(1000),
            max_retry_time: Duration::from_secs(1800),
        }
    }
}

/// Per-worker run-loop pacing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLoopConfig {
    pub claim_lease: Duration,
    /// Sleep between `next_ready_task` polls when the queue is empty or a circuit
    /// is blocking.
    pub idle_poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            claim_lease: Duration::from_secs(300),
            idle_poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Pool-level pacing: how often the reaper calls
/// `Store::reclaim_stale`, and how long a worker may go without a heartbeat before
/// it's considered stale.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub reaper_interval: Duration,
    pub stale_after: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            reaper_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        }
    }
}
