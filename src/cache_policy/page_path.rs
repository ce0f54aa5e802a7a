//! Canonical page path resolution.
//!
//! Legacy URLs come in many shapes for the same page: the HTML view, a CSV
//! export, a chart image produced by `/generator?uri=...`, a file download,
//! and so on. [`resolve_page_path`] maps all of them onto one canonical path,
//! which is the key the cache-time service stores release times under.
//!
//! Resolution is an ordered cascade and the first rule that resolves wins:
//!
//! ```text
//! strip trailing "/"
//!   └─► visualisation bundle ─────────────────────────────► done
//!   └─► resource endpoint (?uri=...) → continue on decoded uri
//!   └─► bulletin / article ───────────────────────────────► done
//!   └─► methodology / QMI / ad hoc ───────────────────────► done
//!   └─► strip "/data" or a trailing file name
//!   └─► timeseries (minus /linechartconfig) ──────────────► done
//!   └─► dataset ──────────────────────────────────────────► done
//!   └─► unchanged
//! ```

use crate::error::PagePathError;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{error, info};

/// Endpoints that render a page's resource named by a `uri` query parameter.
const RESOURCE_ENDPOINTS: &[&str] = &[
    "/chartconfig",
    "/chartimage",
    "/embed",
    "/chart",
    "/resource",
    "/generator",
    "/file",
    "/export",
];

// SAFETY: .expect() on LazyLock with compile-time literal patterns, all of
// which are exercised by test_patterns_compile().
static VISUALISATIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^/visualisations/[^/]+)/")
        .expect("BUG: VISUALISATIONS regex is invalid — this is a programmer error")
});

static BULLETINS_OR_ARTICLES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.+/(bulletins|articles)(?:/[^/]+){2})")
        .expect("BUG: BULLETINS_OR_ARTICLES regex is invalid — this is a programmer error")
});

static RELATED_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/related[Dd]ata$")
        .expect("BUG: RELATED_DATA regex is invalid — this is a programmer error")
});

static METHODOLOGIES_QMIS_OR_ADHOCS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".+/(methodologies|qmis|adhocs)/([^/]+)")
        .expect("BUG: METHODOLOGIES_QMIS_OR_ADHOCS regex is invalid — this is a programmer error")
});

static FILE_NAME_WITH_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.*)/[^/]+\.[0-9A-Za-z_]+$")
        .expect("BUG: FILE_NAME_WITH_EXTENSION regex is invalid — this is a programmer error")
});

static TIMESERIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.+/timeseries(?:/[^/]+){0,2})")
        .expect("BUG: TIMESERIES regex is invalid — this is a programmer error")
});

static DATASETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.+/datasets(?:/[^/]+){0,2})")
        .expect("BUG: DATASETS regex is invalid — this is a programmer error")
});

/// Outcome of one cascade rule.
enum Step {
    /// The canonical path is known; stop.
    Resolved(String),
    /// Carry on with the (possibly rewritten) URI.
    Continue(String),
}

/// Resolve the canonical page path for a request URI (path plus query).
///
/// # Errors
///
/// Returns [`PagePathError::Decode`] when a resource endpoint's `uri`
/// parameter is not valid percent-encoding.
pub fn resolve_page_path(uri: &str) -> Result<String, PagePathError> {
    info!(uri = %uri, "Calculating page path");

    let uri = uri.strip_suffix('/').unwrap_or(uri);

    if let Some(path) = visualisation_bundle(uri) {
        return Ok(path);
    }

    let uri = match resource_target(uri) {
        Ok(Step::Resolved(path)) => return Ok(path),
        Ok(Step::Continue(next)) => next,
        Err(e) => {
            error!(uri = %uri, error = %e, "Unable to decode the 'uri' query parameter");
            return Err(e);
        }
    };

    if let Some(path) = bulletin_or_article(&uri) {
        return Ok(path);
    }

    if let Some(path) = methodology_qmi_or_adhoc(&uri) {
        return Ok(path);
    }

    let uri = trim_unneeded_suffix(&uri);

    if let Some(path) = timeseries(uri) {
        return Ok(path);
    }

    if let Some(path) = dataset(uri) {
        return Ok(path);
    }

    Ok(uri.to_string())
}

fn visualisation_bundle(uri: &str) -> Option<String> {
    VISUALISATIONS
        .captures(uri)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn is_resource_endpoint(uri: &str) -> bool {
    RESOURCE_ENDPOINTS.iter().any(|endpoint| {
        uri.strip_prefix(endpoint)
            .is_some_and(|rest| rest.starts_with('?'))
    })
}

/// Swap a resource endpoint URI for the page named by its `uri` parameter.
///
/// Never resolves on its own; the decoded URI keeps cascading. A resource
/// endpoint without a usable `uri` parameter carries on unchanged.
fn resource_target(uri: &str) -> Result<Step, PagePathError> {
    if !is_resource_endpoint(uri) {
        return Ok(Step::Continue(uri.to_string()));
    }

    let query = uri.split_once('?').map(|(_, q)| q).unwrap_or("");

    match uri_param(query) {
        Some(value) => {
            let decoded = query_unescape(&value).map_err(|reason| PagePathError::Decode {
                uri: uri.to_string(),
                reason,
            })?;
            let decoded = String::from_utf8_lossy(&decoded);
            let trimmed = decoded.strip_suffix('/').unwrap_or(&decoded);
            Ok(Step::Continue(trimmed.to_string()))
        }
        None => Ok(Step::Continue(uri.to_string())),
    }
}

/// First `uri` value of a query string, query-decoded once.
///
/// Pairs that fail to decode or contain `;` are skipped, so a malformed pair
/// never hides a later valid one.
fn uri_param(query: &str) -> Option<Vec<u8>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.contains(';'))
        .find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = query_unescape(key.as_bytes()).ok()?;
            if key != b"uri" {
                return None;
            }
            query_unescape(value.as_bytes()).ok()
        })
}

/// Strict query-component unescape: `+` becomes a space and every `%` must
/// start a two-digit hex escape. The result may not be UTF-8.
fn query_unescape(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| hex_value(*b));
                let lo = bytes.get(i + 2).and_then(|b| hex_value(*b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        let end = (i + 3).min(bytes.len());
                        return Err(format!(
                            "invalid URL escape {:?}",
                            String::from_utf8_lossy(&bytes[i..end])
                        ));
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    Ok(out)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn bulletin_or_article(uri: &str) -> Option<String> {
    let path = BULLETINS_OR_ARTICLES.captures(uri)?.get(1)?.as_str();
    Some(bulletin_extension_view(path))
}

/// Map extension views of a bulletin or article back to the page itself.
fn bulletin_extension_view(path: &str) -> String {
    if let Some(base) = path.strip_suffix("/previousreleases") {
        return format!("{}/latest", base);
    }

    RELATED_DATA.replace(path, "").into_owned()
}

fn methodology_qmi_or_adhoc(uri: &str) -> Option<String> {
    METHODOLOGIES_QMIS_OR_ADHOCS
        .find(uri)
        .map(|m| m.as_str().to_string())
}

fn trim_unneeded_suffix(uri: &str) -> &str {
    if let Some(trimmed) = uri.strip_suffix("/data") {
        return trimmed;
    }

    FILE_NAME_WITH_EXTENSION
        .captures(uri)
        .and_then(|caps| caps.get(1))
        .map_or(uri, |m| m.as_str())
}

fn timeseries(uri: &str) -> Option<String> {
    let path = TIMESERIES.captures(uri)?.get(1)?.as_str();
    Some(path.strip_suffix("/linechartconfig").unwrap_or(path).to_string())
}

fn dataset(uri: &str) -> Option<String> {
    DATASETS
        .captures(uri)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
