//! Error types for the legacy cache proxy.
//!
//! Forwarding errors ([`ProxyError`]) are turned into generic client
//! responses. Cache-policy errors ([`PagePathError`], [`ReleaseTimeError`])
//! never reach the client: the max-age calculator recovers them into the
//! errored TTL.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode, header};
use thiserror::Error;

/// Errors raised while forwarding a request to an upstream service.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The outbound request could not be built (maps to 500).
    #[error("failed to construct upstream request: {0}")]
    RequestConstruction(String),

    /// The upstream could not be reached or failed before responding (maps to 502).
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream did not respond in time (maps to 504).
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// Copying the upstream body to the client failed after headers were sent.
    #[error("failed to copy upstream body: {0}")]
    UpstreamBodyCopy(String),
}

impl ProxyError {
    /// HTTP status code reported to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RequestConstruction(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamBodyCopy(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Convert the error into a client response.
    ///
    /// The body only carries the canonical reason phrase, so upstream
    /// addresses and connection details stay in the logs.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let status = self.status();
        let message = status.canonical_reason().unwrap_or("Error");

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
            .body(Full::new(Bytes::from(format!("{message}\n"))))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from_static(
                    b"Internal Server Error\n",
                )));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Body read failures from upstream connections.
impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::UpstreamBodyCopy(e.to_string())
    }
}

impl From<std::convert::Infallible> for ProxyError {
    fn from(e: std::convert::Infallible) -> Self {
        match e {}
    }
}

/// Result type alias for forwarding operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors from canonical page path resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PagePathError {
    /// The `uri` query parameter of a resource endpoint is not valid percent-encoding.
    #[error("unable to decode the 'uri' query parameter of {uri}: {reason}")]
    Decode { uri: String, reason: String },
}

/// Errors from the cache-time service lookup.
#[derive(Error, Debug)]
pub enum ReleaseTimeError {
    /// Transport-level failure: connect, timeout, or an unreadable body.
    #[error("cache-time service unavailable at {url}: {reason}")]
    Unavailable { url: String, reason: String },

    /// A 200 response whose body is not a cache-time record.
    #[error("malformed cache-time record from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
}
