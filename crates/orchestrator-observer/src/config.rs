//! Poll interval config, serialized the way the circuit-breaker configs are
//! (millis over the wire, `Duration` in memory).

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A single background poller with a configurable interval, ~100 ms by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ObserverConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec() {
        assert_eq!(ObserverConfig::default().poll_interval, Duration::from_millis(100));
    }
}
