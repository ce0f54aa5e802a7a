//! Core proxy service implementation.
//!
//! Per request: answer `/health` locally, otherwise pick the upstream,
//! forward, and pass the response through the [`ResponseDecorator`].

use crate::cache_policy::{MaxAgeCalculator, ReleaseTimeClient};
use crate::config::ProxyConfig;
use crate::decorator::{ResponseBody, ResponseDecorator};
use crate::error::{ProxyError, ProxyResult};
use crate::forwarder::Forwarder;
use crate::routing::UpstreamTargets;
use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode, header};
use std::sync::Arc;
use tower::Service;
use tracing::{debug, error, info};

/// Path answered by the proxy itself.
pub const HEALTH_PATH: &str = "/health";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main proxy service: routing, forwarding and cache-policy decoration.
#[derive(Clone)]
pub struct ProxyService {
    targets: Arc<UpstreamTargets>,
    forwarder: Forwarder,
    decorator: ResponseDecorator,
}

impl ProxyService {
    pub fn new(targets: UpstreamTargets, forwarder: Forwarder, decorator: ResponseDecorator) -> Self {
        Self {
            targets: Arc::new(targets),
            forwarder,
            decorator,
        }
    }

    /// Build the service and its outbound clients from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::RequestConstruction` if either HTTP client
    /// cannot be initialised.
    pub fn from_config(config: &ProxyConfig) -> ProxyResult<Self> {
        let release_times = ReleaseTimeClient::new(config.legacy_cache_api_url.clone(), config.read_timeout)
            .map_err(|e| {
                error!(error = %e, "Failed to create cache-time client");
                ProxyError::RequestConstruction(e.to_string())
            })?;
        let calculator = MaxAgeCalculator::new(config.cache_times.clone(), Arc::new(release_times));
        let decorator = ResponseDecorator::new(calculator, config.stale_while_revalidate_seconds);
        let forwarder = Forwarder::from_config(config)?;

        Ok(Self::new(UpstreamTargets::from_config(config), forwarder, decorator))
    }

    /// Handle one inbound request.
    ///
    /// # Errors
    ///
    /// Forwarding errors are returned for the caller to turn into a generic
    /// 500/502/504 response via [`ProxyError::to_response`].
    pub async fn handle_request<B>(&self, req: Request<B>) -> ProxyResult<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        if req.uri().path() == HEALTH_PATH {
            return Ok(health_response());
        }

        let method = req.method().clone();
        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        let (upstream, base_url) = self.targets.resolve(req.uri().path());
        info!(
            method = %method,
            uri = %request_uri,
            upstream = %upstream,
            target = %base_url,
            "Proxying request"
        );

        let response = self.forwarder.forward(req, base_url).await?;
        debug!(
            upstream = %upstream,
            status = response.status().as_u16(),
            "Upstream responded"
        );

        Ok(self.decorator.decorate(&method, &request_uri, response).await)
    }
}

fn health_response() -> Response<ResponseBody> {
    let body = serde_json::json!({ "status": "OK" }).to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(ProxyError::from).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()).map_err(ProxyError::from).boxed()))
}

impl<B> Service<Request<B>> for ProxyService
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ResponseBody>;
    type Error = ProxyError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle_request(req).await })
    }
}
