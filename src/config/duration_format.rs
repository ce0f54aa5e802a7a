//! Duration parsing for environment configuration.
//!
//! Accepts `humantime` syntax: `30s`, `15m`, `4h`, `1h30m`, `1h 30m`.
//! A bare `0` is accepted as a zero duration.

use std::time::Duration;
use tracing::warn;

/// Parse a duration string.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let trimmed = s.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    humantime::parse_duration(trimmed)
        .map_err(|e| format!("invalid duration '{}': {} (expected e.g. 30s, 15m, 1h30m)", s, e))
}

/// Format a duration the way it is written in the environment.
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

/// Read a duration from an environment variable.
///
/// Missing variables yield `default`. Unparsable values log a warning and
/// also yield `default`.
pub fn env_duration(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(val) => match parse_duration(&val) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %format_duration(default),
                    reason = %reason,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
