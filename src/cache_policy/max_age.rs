//! Max-age calculation.
//!
//! Decision order:
//!
//! 1. static assets, `/ons/` and versioned (`/previous/vN`) URIs: long TTL
//! 2. search and listing pages: short TTL
//! 3. canonical page path cannot be resolved: errored TTL
//! 4. cache-time lookup:
//!    - transport error, malformed record, unexpected status: errored TTL
//!    - 404 or no release time: default TTL
//!    - release in the future: time remaining if below the default, else default
//!    - released within the publish expiry offset (when enabled): short TTL
//!    - otherwise: default TTL

use super::page_path::resolve_page_path;
use super::release_time::ReleaseTimeSource;
use crate::config::CacheTimes;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{error, info};

const LEGACY_ASSET_FOLDERS: &[&str] = &["/img/", "/css/", "/scss/", "/js/", "/fonts/"];

// SAFETY: .expect() on LazyLock with compile-time literal patterns, covered
// by test_patterns_compile().
static VERSIONED_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/previous/v\d+")
        .expect("BUG: VERSIONED_URI regex is invalid — this is a programmer error")
});

static SEARCH_PAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"/(allmethodologies|releasecalendar|timeseriestool|datalist|publications|staticlist|topicspecificmethodology|relateddata|alladhocs|publishedrequests)$",
    )
    .expect("BUG: SEARCH_PAGE regex is invalid — this is a programmer error")
});

/// A computed cache lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAge {
    /// Lifetime in whole seconds.
    pub seconds: u64,
    /// True when counting down to a release rather than using a constant.
    pub dynamic: bool,
}

impl MaxAge {
    fn constant(ttl: Duration) -> Self {
        Self {
            seconds: ttl.as_secs(),
            dynamic: false,
        }
    }
}

/// Computes `max-age` values from URIs, release times and the configured TTLs.
#[derive(Clone)]
pub struct MaxAgeCalculator {
    times: CacheTimes,
    source: Arc<dyn ReleaseTimeSource>,
}

impl MaxAgeCalculator {
    pub fn new(times: CacheTimes, source: Arc<dyn ReleaseTimeSource>) -> Self {
        Self { times, source }
    }

    /// Compute the max-age for a request URI (path plus query) as of now.
    pub async fn compute(&self, uri: &str) -> MaxAge {
        self.compute_at(uri, Utc::now()).await
    }

    /// Compute the max-age for a request URI as of `now`.
    pub async fn compute_at(&self, uri: &str, now: DateTime<Utc>) -> MaxAge {
        info!(uri = %uri, "Calculating max-age");

        if is_legacy_asset_uri(uri) || is_ons_uri(uri) || is_versioned_uri(uri) {
            return MaxAge::constant(self.times.long);
        }

        if is_search_page_uri(uri) {
            return MaxAge::constant(self.times.short);
        }

        let page_path = match resolve_page_path(uri) {
            Ok(path) => path,
            Err(e) => {
                error!(uri = %uri, error = %e, "Error calculating the max-age directive");
                return MaxAge::constant(self.times.errored);
            }
        };

        let lookup = match self.source.fetch_release_time(&page_path).await {
            Ok(lookup) => lookup,
            Err(e) => {
                error!(uri = %uri, page_path = %page_path, error = %e, "Error calculating the max-age directive");
                return MaxAge::constant(self.times.errored);
            }
        };

        if lookup.status == StatusCode::NOT_FOUND {
            return MaxAge::constant(self.times.default);
        }

        if lookup.status != StatusCode::OK {
            error!(
                uri = %uri,
                page_path = %page_path,
                status = lookup.status.as_u16(),
                "Error calculating the max-age directive: unexpected cache-time service status"
            );
            return MaxAge::constant(self.times.errored);
        }

        match lookup.release_time {
            Some(release_time) => self.from_release_time(release_time, now),
            None => MaxAge::constant(self.times.default),
        }
    }

    fn from_release_time(&self, release_time: DateTime<Utc>, now: DateTime<Utc>) -> MaxAge {
        if release_time > now {
            let remaining = release_time - now;
            let below_default = remaining
                .to_std()
                .is_ok_and(|remaining| remaining < self.times.default);

            if below_default && self.times.enable_max_age_countdown {
                return MaxAge {
                    seconds: u64::try_from(remaining.num_seconds()).unwrap_or(0),
                    dynamic: true,
                };
            }
            return MaxAge::constant(self.times.default);
        }

        if self.times.enable_publish_expiry_offset
            && released_recently(release_time, self.times.publish_expiry_offset, now)
        {
            return MaxAge::constant(self.times.short);
        }

        MaxAge::constant(self.times.default)
    }
}

fn is_legacy_asset_uri(uri: &str) -> bool {
    LEGACY_ASSET_FOLDERS
        .iter()
        .any(|folder| uri.starts_with(folder))
        || uri == "/favicon.ico"
}

fn is_ons_uri(uri: &str) -> bool {
    uri.starts_with("/ons/")
}

fn is_versioned_uri(uri: &str) -> bool {
    VERSIONED_URI.is_match(uri)
}

/// Search and listing pages are matched on the path only.
fn is_search_page_uri(uri: &str) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    SEARCH_PAGE.is_match(path)
}

fn released_recently(release_time: DateTime<Utc>, offset: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(offset)
        .ok()
        .and_then(|offset| release_time.checked_add_signed(offset))
        .is_some_and(|expiry| expiry > now)
}
