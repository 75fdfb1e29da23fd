//! Per-level circuit configuration and its defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `Duration` as milliseconds, matching the convention used
/// throughout the orchestrator's config structs.
pub(crate) mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Stage circuit: prevents a single stage of a single task from consuming
/// unbounded retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageCircuitConfig {
    pub max_failures: i32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for StageCircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl StageCircuitConfig {
    pub fn with_max_failures(mut self, n: i32) -> Self {
        self.max_failures = n;
        self
    }

    pub fn with_recovery_timeout(mut self, d: Duration) -> Self {
        self.recovery_timeout = d;
        self
    }
}

/// Worker circuit: pauses a worker that strings together consecutive task
/// failures; extends its pause on repeated recovery failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCircuitConfig {
    pub max_failures: i32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    pub max_extensions: i32,
    /// Number of probe requests admitted at once while half-open.
    pub half_open_max_requests: i32,
    /// Consecutive half-open successes required before closing.
    pub success_threshold: i32,
}

impl Default for WorkerCircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            recovery_timeout: Duration::from_secs(300),
            max_extensions: 3,
            half_open_max_requests: 1,
            success_threshold: 1,
        }
    }
}

impl WorkerCircuitConfig {
    pub fn with_max_failures(mut self, n: i32) -> Self {
        self.max_failures = n;
        self
    }

    pub fn with_recovery_timeout(mut self, d: Duration) -> Self {
        self.recovery_timeout = d;
        self
    }

    pub fn with_max_extensions(mut self, n: i32) -> Self {
        self.max_extensions = n;
        self
    }

    pub fn with_half_open_max_requests(mut self, n: i32) -> Self {
        self.half_open_max_requests = n;
        self
    }

    pub fn with_success_threshold(mut self, n: i32) -> Self {
        self.success_threshold = n;
        self
    }
}

/// System circuit: halts execution when a quorum of workers is failing within
/// a sliding time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemCircuitConfig {
    pub min_workers_for_threshold: i32,
    pub failure_threshold_percent: f64,
    #[serde(with = "duration_millis")]
    pub window: Duration,
    #[serde(with = "duration_millis")]
    pub auto_recovery_timeout: Duration,
    pub auto_recovery_enabled: bool,
    #[serde(with = "duration_millis")]
    pub graceful_shutdown_timeout: Duration,
}

impl Default for SystemCircuitConfig {
    fn default() -> Self {
        Self {
            min_workers_for_threshold: 2,
            failure_threshold_percent: 50.0,
            window: Duration::from_secs(300),
            auto_recovery_timeout: Duration::from_secs(600),
            auto_recovery_enabled: true,
            graceful_shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl SystemCircuitConfig {
    pub fn with_min_workers_for_threshold(mut self, n: i32) -> Self {
        self.min_workers_for_threshold = n;
        self
    }

    pub fn with_failure_threshold_percent(mut self, p: f64) -> Self {
        self.failure_threshold_percent = p;
        self
    }

    pub fn with_window(mut self, d: Duration) -> Self {
        self.window = d;
        self
    }

    pub fn with_auto_recovery_timeout(mut self, d: Duration) -> Self {
        self.auto_recovery_timeout = d;
        self
    }

    pub fn with_auto_recovery_enabled(mut self, enabled: bool) -> Self {
        self.auto_recovery_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_defaults_match_spec() {
        let c = StageCircuitConfig::default();
        assert_eq!(c.max_failures, 3);
        assert_eq!(c.recovery_timeout, Duration::from_secs(300));
    }

    #[test]
    fn system_defaults_match_spec() {
        let c = SystemCircuitConfig::default();
        assert_eq!(c.min_workers_for_threshold, 2);
        assert_eq!(c.failure_threshold_percent, 50.0);
    }

    #[test]
    fn duration_millis_round_trips() {
        let c = StageCircuitConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: StageCircuitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}
