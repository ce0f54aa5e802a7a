//! Release-time lookups against the cache-time service.
//!
//! Records are keyed by the lowercase hex MD5 of the canonical page path:
//!
//! ```text
//! GET {base}/v1/cache-times/{md5(page_path)}
//!   200 {"release_time": "2024-03-14T07:00:00Z"}  → Some(release time)
//!   200 {} / {"release_time": null}                → None
//!   404                                            → no record
//! ```
//!
//! Exactly one request is made per lookup and failures are never retried;
//! the max-age calculator turns them into the errored TTL.

use crate::error::ReleaseTimeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Path of the cache-time resource collection on the service.
pub const CACHE_TIMES_PATH: &str = "/v1/cache-times/";

/// Result of a lookup that reached the cache-time service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTimeLookup {
    /// HTTP status returned by the service.
    pub status: StatusCode,
    /// Scheduled release time; only ever set on a 200.
    pub release_time: Option<DateTime<Utc>>,
}

/// A cache-time record as stored by the service. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct CacheTimeRecord {
    #[serde(default)]
    release_time: Option<DateTime<Utc>>,
}

/// Stable lookup identifier for a canonical page path.
pub fn cache_time_id(page_path: &str) -> String {
    format!("{:x}", md5::compute(page_path.as_bytes()))
}

/// Source of release times, abstracted so the calculator can be tested
/// without a network.
#[async_trait]
pub trait ReleaseTimeSource: Send + Sync {
    /// Look up the release time recorded for `page_path`.
    ///
    /// Non-200 statuses are returned as `Ok` with no release time; only
    /// transport failures and malformed records are errors.
    async fn fetch_release_time(
        &self,
        page_path: &str,
    ) -> Result<ReleaseTimeLookup, ReleaseTimeError>;
}

/// HTTP client for the cache-time service.
///
/// Holds a pooled `reqwest::Client`, so one instance should be shared across
/// requests.
#[derive(Debug, Clone)]
pub struct ReleaseTimeClient {
    client: Client,
    base_url: String,
}

impl ReleaseTimeClient {
    /// Build a client for `base_url` with a per-lookup `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseTimeError::Unavailable`] if the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ReleaseTimeError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ReleaseTimeError::Unavailable {
                url: base_url.clone(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, base_url })
    }

    /// Full URL of the cache-time resource for `page_path`.
    pub fn resource_url(&self, page_path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.trim_end_matches('/'),
            CACHE_TIMES_PATH,
            cache_time_id(page_path)
        )
    }

    fn classify_error(&self, url: &str, error: reqwest::Error) -> ReleaseTimeError {
        if error.is_timeout() {
            warn!(url = %url, "Cache-time lookup timed out");
        } else if error.is_connect() {
            warn!(url = %url, "Failed to connect to cache-time service");
        } else {
            warn!(url = %url, error = %error, "Cache-time lookup failed");
        }

        ReleaseTimeError::Unavailable {
            url: url.to_string(),
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl ReleaseTimeSource for ReleaseTimeClient {
    async fn fetch_release_time(
        &self,
        page_path: &str,
    ) -> Result<ReleaseTimeLookup, ReleaseTimeError> {
        let url = self.resource_url(page_path);
        debug!(page_path = %page_path, url = %url, "Fetching release time");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify_error(&url, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Ok(ReleaseTimeLookup {
                status,
                release_time: None,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify_error(&url, e))?;

        let record: CacheTimeRecord =
            serde_json::from_slice(&body).map_err(|e| ReleaseTimeError::MalformedResponse {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        Ok(ReleaseTimeLookup {
            status,
            release_time: record.release_time,
        })
    }
}
