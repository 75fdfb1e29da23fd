//! Bounds-checked numeric configuration.
//!
//! Known keys are clamped to a `(min, max)` range on read; unknown keys pass through
//! unclamped. An unparseable stored value falls back to the caller-supplied default.

use tracing::warn;

/// `(min, max)` inclusive bounds for config keys that have one. Keys absent from this
/// table (e.g. `max_invocations_per_session`, `budget_warning_threshold`) are read but
/// never clamped.
pub const CONFIG_BOUNDS: &[(&str, i64, i64)] = &[
    ("max_green_attempts", 1, 10),
    ("green_retry_delay_ms", 0, 10_000),
    ("max_green_retry_time_seconds", 60, 7_200),
];

/// Default values for the well-known keys, used when a key has never been set.
pub const CONFIG_DEFAULTS: &[(&str, i64)] = &[
    ("max_green_attempts", 2),
    ("green_retry_delay_ms", 1_000),
    ("max_green_retry_time_seconds", 1_800),
    ("max_invocations_per_session", 100),
    ("budget_warning_threshold", 80),
];

pub fn default_for(key: &str) -> Option<i64> {
    CONFIG_DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

/// Clamp `value` to the bounds registered for `key`, logging a warning if clamping
/// occurred. Keys with no registered bounds are returned unchanged.
pub fn clamp_config_int(key: &str, value: i64) -> i64 {
    match CONFIG_BOUNDS.iter().find(|(k, _, _)| *k == key) {
        Some((_, min, max)) => {
            let clamped = value.clamp(*min, *max);
            if clamped != value {
                warn!(
                    key,
                    value,
                    clamped,
                    min = *min,
                    max = *max,
                    "config value out of bounds, clamping"
                );
            }
            clamped
        }
        None => value,
    }
}

/// Parse a raw stored string into an `i64`, clamping against known bounds. Falls back
/// to `default` (itself still clamped) when the stored value can't be parsed.
pub fn parse_and_clamp(key: &str, raw: Option<&str>, default: i64) -> i64 {
    match raw.and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => clamp_config_int(key, v),
        None => {
            if let Some(raw) = raw {
                warn!(key, raw, default, "unparseable config value, using default");
            }
            clamp_config_int(key, default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_below_min() {
        assert_eq!(clamp_config_int("max_green_attempts", 0), 1);
    }

    #[test]
    fn clamps_above_max() {
        assert_eq!(clamp_config_int("max_green_attempts", 99), 10);
    }

    #[test]
    fn passes_through_unknown_key() {
        assert_eq!(clamp_config_int("some_unbounded_key", 999_999), 999_999);
    }

    #[test]
    fn parse_and_clamp_falls_back_on_garbage() {
        assert_eq!(
            parse_and_clamp("max_green_attempts", Some("not-a-number"), 2),
            2
        );
    }

    #[test]
    fn parse_and_clamp_clamps_parsed_value() {
        assert_eq!(parse_and_clamp("max_green_attempts", Some("50"), 2), 10);
    }
}
