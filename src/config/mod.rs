//! Runtime configuration for the legacy cache proxy.
//!
//! All options are read once from the environment at start-up and the
//! resulting [`ProxyConfig`] is shared immutably (behind `Arc`) with every
//! component. Nothing re-reads the environment while serving requests.
//!
//! # Environment Variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BIND_ADDR` | `:29200` |
//! | `BABBAGE_URL` | `http://localhost:8080` |
//! | `RELEASE_CALENDAR_URL` | `http://localhost:27700` |
//! | `SEARCH_CONTROLLER_URL` | `http://localhost:25000` |
//! | `ENABLE_SEARCH_CONTROLLER` | `false` |
//! | `LEGACY_CACHE_API_URL` | `http://localhost:29100` |
//! | `CACHE_TIME_DEFAULT` | `15m` |
//! | `CACHE_TIME_ERRORED` | `30s` |
//! | `CACHE_TIME_LONG` | `4h` |
//! | `CACHE_TIME_SHORT` | `10s` |
//! | `ENABLE_PUBLISH_EXPIRY_OFFSET` | `false` |
//! | `PUBLISH_EXPIRY_OFFSET` | `3m` |
//! | `ENABLE_MAX_AGE_COUNTDOWN` | `true` |
//! | `STALE_WHILE_REVALIDATE_SECONDS` | `-1` |
//! | `READ_TIMEOUT` | `15s` |
//! | `WRITE_TIMEOUT` | `30s` |
//! | `HTTP_MAX_CONNECTIONS` | `0` |
//! | `GRACEFUL_SHUTDOWN_TIMEOUT` | `5s` |

pub mod duration_format;
pub mod error;

pub use duration_format::{env_duration, format_duration, parse_duration};
pub use error::ConfigError;

use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

/// TTL constants and feature flags consumed by the max-age calculator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTimes {
    /// TTL for ordinary pages with no imminent release.
    pub default: Duration,
    /// TTL used when the page path or release time could not be determined.
    pub errored: Duration,
    /// TTL for static assets and versioned content that never changes.
    pub long: Duration,
    /// TTL for search/listing pages and freshly published content.
    pub short: Duration,
    /// Re-check freshly published pages quickly for `publish_expiry_offset`.
    pub enable_publish_expiry_offset: bool,
    /// Window after a release during which the short TTL applies.
    pub publish_expiry_offset: Duration,
    /// Count the TTL down to an upcoming release instead of using the default.
    pub enable_max_age_countdown: bool,
}

impl Default for CacheTimes {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(15 * 60),
            errored: Duration::from_secs(30),
            long: Duration::from_secs(4 * 60 * 60),
            short: Duration::from_secs(10),
            enable_publish_expiry_offset: false,
            publish_expiry_offset: Duration::from_secs(3 * 60),
            enable_max_age_countdown: true,
        }
    }
}

/// Runtime configuration for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address; `:port` binds every interface.
    pub bind_addr: String,

    /// Primary content service (Babbage).
    pub babbage_url: String,

    /// Release-calendar service.
    pub release_calendar_url: String,

    /// Search-controller service.
    pub search_controller_url: String,

    /// Route related-data and previous-releases views to the search controller.
    pub enable_search_controller: bool,

    /// Base URL of the cache-time service.
    pub legacy_cache_api_url: String,

    /// TTL constants and cache-policy flags.
    pub cache_times: CacheTimes,

    /// `stale-while-revalidate` seconds; negative omits the directive.
    pub stale_while_revalidate_seconds: i64,

    /// Per-chunk deadline on streamed upstream bodies, and the cache-time
    /// lookup timeout.
    pub read_timeout: Duration,

    /// Total deadline for streaming one upstream response body.
    pub write_timeout: Duration,

    /// Cap on concurrently served inbound connections (0 = unlimited).
    pub http_max_connections: usize,

    /// How long in-flight connections may drain after a shutdown signal.
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: ":29200".to_string(),
            babbage_url: "http://localhost:8080".to_string(),
            release_calendar_url: "http://localhost:27700".to_string(),
            search_controller_url: "http://localhost:25000".to_string(),
            enable_search_controller: false,
            legacy_cache_api_url: "http://localhost:29100".to_string(),
            cache_times: CacheTimes::default(),
            stale_while_revalidate_seconds: -1,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(30),
            http_max_connections: 0,
            graceful_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Invalid values are logged and replaced with their default; call
    /// [`ProxyConfig::validate`] afterwards to reject unusable settings.
    pub fn from_env() -> Self {
        let default = Self::default();
        let times = default.cache_times.clone();

        Self {
            bind_addr: env_string("BIND_ADDR", default.bind_addr),
            babbage_url: env_string("BABBAGE_URL", default.babbage_url),
            release_calendar_url: env_string("RELEASE_CALENDAR_URL", default.release_calendar_url),
            search_controller_url: env_string(
                "SEARCH_CONTROLLER_URL",
                default.search_controller_url,
            ),
            enable_search_controller: env_bool(
                "ENABLE_SEARCH_CONTROLLER",
                default.enable_search_controller,
            ),
            legacy_cache_api_url: env_string("LEGACY_CACHE_API_URL", default.legacy_cache_api_url),
            cache_times: CacheTimes {
                default: env_duration("CACHE_TIME_DEFAULT", times.default),
                errored: env_duration("CACHE_TIME_ERRORED", times.errored),
                long: env_duration("CACHE_TIME_LONG", times.long),
                short: env_duration("CACHE_TIME_SHORT", times.short),
                enable_publish_expiry_offset: env_bool(
                    "ENABLE_PUBLISH_EXPIRY_OFFSET",
                    times.enable_publish_expiry_offset,
                ),
                publish_expiry_offset: env_duration(
                    "PUBLISH_EXPIRY_OFFSET",
                    times.publish_expiry_offset,
                ),
                enable_max_age_countdown: env_bool(
                    "ENABLE_MAX_AGE_COUNTDOWN",
                    times.enable_max_age_countdown,
                ),
            },
            stale_while_revalidate_seconds: parse_env_warn(
                "STALE_WHILE_REVALIDATE_SECONDS",
                default.stale_while_revalidate_seconds,
            ),
            read_timeout: env_duration("READ_TIMEOUT", default.read_timeout),
            write_timeout: env_duration("WRITE_TIMEOUT", default.write_timeout),
            http_max_connections: parse_env_warn(
                "HTTP_MAX_CONNECTIONS",
                default.http_max_connections,
            ),
            graceful_shutdown_timeout: env_duration(
                "GRACEFUL_SHUTDOWN_TIMEOUT",
                default.graceful_shutdown_timeout,
            ),
        }
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("BABBAGE_URL", &self.babbage_url)?;
        validate_url("RELEASE_CALENDAR_URL", &self.release_calendar_url)?;
        validate_url("SEARCH_CONTROLLER_URL", &self.search_controller_url)?;
        validate_url("LEGACY_CACHE_API_URL", &self.legacy_cache_api_url)?;

        if self.cache_times.default.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "CACHE_TIME_DEFAULT",
                value: format_duration(self.cache_times.default),
                message: "default cache time must be greater than zero".to_string(),
            });
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "READ_TIMEOUT",
                value: format_duration(self.read_timeout),
                message: "read timeout must be greater than zero".to_string(),
            });
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "WRITE_TIMEOUT",
                value: format_duration(self.write_timeout),
                message: "write timeout must be greater than zero".to_string(),
            });
        }

        self.socket_addr()?;
        Ok(())
    }

    /// Resolve `bind_addr` into a socket address.
    ///
    /// A leading `:` (e.g. `:29200`) listens on all IPv4 interfaces.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.bind_addr.starts_with(':') {
            format!("0.0.0.0{}", self.bind_addr)
        } else {
            self.bind_addr.clone()
        };

        addr.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
            field: "BIND_ADDR",
            value: self.bind_addr.clone(),
            message: e.to_string(),
        })
    }
}

fn validate_url(field: &'static str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        field,
        url: raw.to_string(),
        message: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            field,
            url: raw.to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidUrl {
            field,
            url: raw.to_string(),
            message: "missing host".to_string(),
        });
    }
    Ok(())
}

fn env_string(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default,
    }
}

/// Parse an environment variable, logging a warning if the value is invalid.
///
/// Returns the parsed value on success, or `default` if the variable is
/// unset or cannot be parsed.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Boolean spellings accepted for flags: `1`, `t`, `true` and their
/// uppercase forms, and likewise for false.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => parse_bool(val.trim()).unwrap_or_else(|| {
            warn!(
                env_var = name,
                value = %val,
                default = default,
                "Invalid value for environment variable, using default"
            );
            default
        }),
        Err(_) => default,
    }
}
