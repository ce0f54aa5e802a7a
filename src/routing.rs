//! Upstream target selection.
//!
//! Every inbound request is routed to exactly one of three upstreams. The
//! release-calendar prefix is checked first and wins unconditionally; the
//! search-controller suffixes only apply when the feature flag is on;
//! everything else goes to the primary content service.

use crate::config::ProxyConfig;
use std::fmt;

/// Path prefix served by the release-calendar service.
pub const RELEASE_CALENDAR_PREFIX: &str = "/releases/";

/// Path suffixes served by the search controller when it is enabled.
pub const SEARCH_CONTROLLER_SUFFIXES: &[&str] = &["/relateddata", "/previousreleases"];

/// Upstream services a request can be forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Upstream {
    /// Primary content service (Babbage).
    Primary,
    /// Release-calendar service.
    ReleaseCalendar,
    /// Search-controller service.
    SearchController,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::Primary => "babbage",
            Upstream::ReleaseCalendar => "release-calendar",
            Upstream::SearchController => "search-controller",
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base URLs of the three upstreams plus the search-controller flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTargets {
    pub primary: String,
    pub release_calendar: String,
    pub search_controller: String,
    pub enable_search_controller: bool,
}

impl UpstreamTargets {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            primary: config.babbage_url.clone(),
            release_calendar: config.release_calendar_url.clone(),
            search_controller: config.search_controller_url.clone(),
            enable_search_controller: config.enable_search_controller,
        }
    }

    /// Pick the upstream for a request path (query string ignored).
    pub fn select(&self, path: &str) -> Upstream {
        if path.starts_with(RELEASE_CALENDAR_PREFIX) {
            return Upstream::ReleaseCalendar;
        }

        if self.enable_search_controller
            && SEARCH_CONTROLLER_SUFFIXES
                .iter()
                .any(|suffix| path.ends_with(suffix))
        {
            return Upstream::SearchController;
        }

        Upstream::Primary
    }

    /// Base URL configured for `upstream`.
    pub fn base_url(&self, upstream: Upstream) -> &str {
        match upstream {
            Upstream::Primary => &self.primary,
            Upstream::ReleaseCalendar => &self.release_calendar,
            Upstream::SearchController => &self.search_controller,
        }
    }

    /// Select the upstream for `path` and return it with its base URL.
    pub fn resolve(&self, path: &str) -> (Upstream, &str) {
        let upstream = self.select(path);
        (upstream, self.base_url(upstream))
    }
}
