//! Upstream forwarding.
//!
//! Sends the inbound request to the selected upstream with the same method,
//! headers (minus hop-by-hop headers), `Host` and streamed body. Redirects
//! are returned as-is so the client sees the upstream's redirect semantics.
//! The response body is wrapped in [`DeadlineBody`] so a stalled upstream
//! cannot pin a client connection.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::timeout::{DeadlineBody, StreamDeadlines};
use bytes::Bytes;
use http::Uri;
use http_body::Body;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, error, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming body type sent upstream.
type ClientBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Upstream response body with stream deadlines applied.
pub type UpstreamBody = DeadlineBody<Incoming>;

/// Pooled HTTP(S) client that forwards requests to an upstream base URL.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, ClientBody>,
    deadlines: StreamDeadlines,
    response_timeout: Duration,
}

impl Forwarder {
    /// Create a forwarder.
    ///
    /// `response_timeout` bounds the wait for upstream response headers;
    /// `deadlines` bound the streamed response body.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::RequestConstruction` if the TLS crypto provider
    /// cannot be installed.
    pub fn new(deadlines: StreamDeadlines, response_timeout: Duration) -> ProxyResult<Self> {
        static RUSTLS_INIT: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
        let provider_ready = RUSTLS_INIT.get_or_init(|| {
            // Err means another component installed a provider first.
            let _ = rustls::crypto::ring::default_provider().install_default();
            rustls::crypto::CryptoProvider::get_default().is_some()
        });
        if !provider_ready {
            return Err(ProxyError::RequestConstruction(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_allow_obsolete_multiline_headers_in_responses(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Self {
            client,
            deadlines,
            response_timeout,
        })
    }

    /// Create a forwarder using `READ_TIMEOUT` as the idle deadline and
    /// `WRITE_TIMEOUT` as both the response and total body deadline.
    pub fn from_config(config: &ProxyConfig) -> ProxyResult<Self> {
        Self::new(
            StreamDeadlines::new(config.read_timeout, config.write_timeout),
            config.write_timeout,
        )
    }

    /// Forward `req` to `base_url` + the request's path and query.
    ///
    /// # Errors
    ///
    /// - `RequestConstruction` when the target URI or request cannot be built
    /// - `UpstreamUnavailable` when the upstream cannot be reached
    /// - `UpstreamTimeout` when response headers do not arrive in time
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        base_url: &str,
    ) -> ProxyResult<Response<UpstreamBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = target_uri(base_url, path_and_query)?;

        let (parts, body) = req.into_parts();

        let mut builder = Request::builder().method(parts.method).uri(&target);

        let headers = builder.headers_mut().ok_or_else(|| {
            error!("Failed to get mutable headers from request builder");
            ProxyError::RequestConstruction("request builder in invalid state".to_string())
        })?;
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        let body: ClientBody = body.map_err(Into::into).boxed();
        let upstream_req = builder.body(body).map_err(|e| {
            error!(error = %e, target = %target, "Failed to build upstream request");
            ProxyError::RequestConstruction(format!("failed to build request: {}", e))
        })?;

        debug!(target = %target, "Sending upstream request");

        let upstream_res =
            match tokio::time::timeout(self.response_timeout, self.client.request(upstream_req))
                .await
            {
                Ok(result) => result.map_err(map_client_error)?,
                Err(_) => {
                    warn!(
                        target = %target,
                        timeout_ms = self.response_timeout.as_millis(),
                        "Upstream response timed out"
                    );
                    return Err(ProxyError::UpstreamTimeout(format!(
                        "no response from {} within {:?}",
                        target, self.response_timeout
                    )));
                }
            };

        let (parts, body) = upstream_res.into_parts();
        Ok(Response::from_parts(
            parts,
            DeadlineBody::new(body, self.deadlines),
        ))
    }
}

/// Join an upstream base URL and an inbound path-and-query.
pub fn target_uri(base_url: &str, path_and_query: &str) -> ProxyResult<Uri> {
    let full = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
    full.parse().map_err(|e| {
        ProxyError::RequestConstruction(format!("failed to parse upstream URI {}: {}", full, e))
    })
}

/// Check if a header is a hop-by-hop header that shouldn't be forwarded.
///
/// `connection`, `upgrade` and `transfer-encoding` are left to hyper, which
/// manages them per connection.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    ["keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailers"]
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

/// Map hyper_util client errors to `ProxyError` variants.
fn map_client_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    let message = e.to_string().to_lowercase();

    if e.is_connect() {
        warn!(error = %e, "Upstream connection failed");
        return ProxyError::UpstreamUnavailable(format!("failed to connect to upstream: {}", e));
    }

    if message.contains("timeout") || message.contains("timed out") {
        warn!(error = %e, "Upstream timeout");
        return ProxyError::UpstreamTimeout(format!("upstream timeout: {}", e));
    }

    warn!(error = %e, "Upstream error");
    ProxyError::UpstreamUnavailable(format!("upstream error: {}", e))
}
