//! Response decoration.
//!
//! Decides per response whether the proxy may set the cache lifetime and, if
//! so, rewrites `Cache-Control`. Every response body, decorated or not, is
//! relayed through [`CopyBody`] in bounded chunks.
//!
//! # Decision order
//!
//! 1. method other than GET/HEAD: pass through
//! 2. status other than 2xx/1xx, 304 or 404: pass through
//! 3. upstream `Cache-Control` other than empty, `public` or `private`: pass through
//! 4. otherwise: compute the max-age and rewrite `Cache-Control`

use crate::cache_policy::MaxAgeCalculator;
use crate::error::ProxyError;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::header::{CACHE_CONTROL, HeaderValue};
use hyper::{Method, Response, StatusCode};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, info};

/// Largest chunk handed to the client in one frame.
pub const COPY_CHUNK_SIZE: usize = 128 * 1024;

/// Body type returned to clients.
pub type ResponseBody = BoxBody<Bytes, ProxyError>;

/// Why a response was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThrough {
    Method,
    Status,
    ExplicitPolicy,
}

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cacheability {
    NotCacheable(PassThrough),
    /// Carries the `public`/`private` token to keep, if any.
    Cacheable(Option<String>),
}

/// Classify a response by request method, upstream status and the first
/// upstream `Cache-Control` value.
pub fn classify(
    method: &Method,
    status: StatusCode,
    cache_control: Option<&HeaderValue>,
) -> Cacheability {
    if method != Method::GET && method != Method::HEAD {
        return Cacheability::NotCacheable(PassThrough::Method);
    }

    if !is_cacheable_status(status) {
        return Cacheability::NotCacheable(PassThrough::Status);
    }

    match cache_control {
        None => Cacheability::Cacheable(None),
        Some(value) => match value.to_str() {
            Ok("") => Cacheability::Cacheable(None),
            Ok(token @ ("public" | "private")) => Cacheability::Cacheable(Some(token.to_string())),
            _ => Cacheability::NotCacheable(PassThrough::ExplicitPolicy),
        },
    }
}

fn is_cacheable_status(status: StatusCode) -> bool {
    status.as_u16() < 300 || status == StatusCode::NOT_MODIFIED || status == StatusCode::NOT_FOUND
}

/// Build the rewritten `Cache-Control` value.
///
/// A negative `stale_while_revalidate` omits that directive.
pub fn cache_control_value(existing: Option<&str>, ttl: u64, stale_while_revalidate: i64) -> String {
    let visibility = existing.unwrap_or("public");
    let mut value = format!("{visibility}, s-maxage={ttl}, max-age={ttl}");
    if stale_while_revalidate >= 0 {
        value.push_str(&format!(", stale-while-revalidate={stale_while_revalidate}"));
    }
    value
}

/// Applies the cache policy to upstream responses.
#[derive(Clone)]
pub struct ResponseDecorator {
    calculator: MaxAgeCalculator,
    stale_while_revalidate: i64,
}

impl ResponseDecorator {
    pub fn new(calculator: MaxAgeCalculator, stale_while_revalidate: i64) -> Self {
        Self {
            calculator,
            stale_while_revalidate,
        }
    }

    /// Decorate one upstream response.
    ///
    /// `request_uri` is the inbound path and query; it drives the max-age
    /// lookup. Status, other headers and body bytes are left as received.
    pub async fn decorate<B>(
        &self,
        method: &Method,
        request_uri: &str,
        response: Response<B>,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: Into<ProxyError>,
    {
        let (mut parts, body) = response.into_parts();

        let decision = classify(method, parts.status, parts.headers.get(CACHE_CONTROL));
        match decision {
            Cacheability::NotCacheable(reason) => {
                debug!(
                    uri = %request_uri,
                    status = parts.status.as_u16(),
                    reason = ?reason,
                    "Response passed through without cache policy"
                );
            }
            Cacheability::Cacheable(existing) => {
                let max_age = self.calculator.compute(request_uri).await;
                let value =
                    cache_control_value(existing.as_deref(), max_age.seconds, self.stale_while_revalidate);
                info!(
                    uri = %request_uri,
                    max_age = max_age.seconds,
                    dynamic = max_age.dynamic,
                    cache_control = %value,
                    "Setting Cache-Control"
                );
                match HeaderValue::from_str(&value) {
                    Ok(header) => {
                        parts.headers.insert(CACHE_CONTROL, header);
                    }
                    Err(e) => {
                        error!(uri = %request_uri, error = %e, "Failed to encode Cache-Control");
                    }
                }
            }
        }

        Response::from_parts(parts, CopyBody::new(body).boxed())
    }
}

/// Relays an upstream body in frames of at most [`COPY_CHUNK_SIZE`] bytes.
///
/// A mid-stream failure is logged and returned, which aborts the client
/// response since its head has already been sent.
pub struct CopyBody<B> {
    inner: B,
    pending: Option<Bytes>,
}

impl<B> CopyBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            pending: None,
        }
    }
}

impl<B> CopyBody<B> {
    fn next_chunk(&mut self, mut data: Bytes) -> Bytes {
        if data.len() > COPY_CHUNK_SIZE {
            let chunk = data.split_to(COPY_CHUNK_SIZE);
            self.pending = Some(data);
            chunk
        } else {
            data
        }
    }
}

impl<B> Body for CopyBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<ProxyError>,
{
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if let Some(rest) = this.pending.take() {
            let chunk = this.next_chunk(rest);
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => {
                    let chunk = this.next_chunk(data);
                    Poll::Ready(Some(Ok(Frame::data(chunk))))
                }
                Err(frame) => Poll::Ready(Some(Ok(frame))),
            },
            Poll::Ready(Some(Err(e))) => {
                let e: ProxyError = e.into();
                error!(error = %e, "Failed to copy upstream body to client");
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let inner = self.inner.size_hint();
        let Some(pending) = &self.pending else {
            return inner;
        };
        let extra = pending.len() as u64;
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower().saturating_add(extra));
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper.saturating_add(extra));
        }
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_policy::{ReleaseTimeLookup, ReleaseTimeSource};
    use crate::config::CacheTimes;
    use crate::error::ReleaseTimeError;
    use async_trait::async_trait;
    use http_body_util::Full;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReleaseTimeSource for CountingSource {
        async fn fetch_release_time(
            &self,
            _page_path: &str,
        ) -> Result<ReleaseTimeLookup, ReleaseTimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReleaseTimeLookup {
                status: StatusCode::NOT_FOUND,
                release_time: None,
            })
        }
    }

    fn decorator(swr: i64) -> (ResponseDecorator, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let times = CacheTimes {
            default: Duration::from_secs(100),
            errored: Duration::from_secs(50),
            long: Duration::from_secs(9999),
            short: Duration::from_secs(3),
            ..CacheTimes::default()
        };
        let calculator = MaxAgeCalculator::new(times, source.clone());
        (ResponseDecorator::new(calculator, swr), source)
    }

    fn upstream(status: StatusCode, cache_control: Option<&str>) -> Response<Full<Bytes>> {
        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "text/html")
            .header("x-upstream", "babbage");
        if let Some(cc) = cache_control {
            builder = builder.header(CACHE_CONTROL, cc);
        }
        builder.body(Full::new(Bytes::from("<html></html>"))).unwrap()
    }

    #[test]
    fn test_classify_method() {
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS] {
            assert_eq!(
                classify(&method, StatusCode::OK, None),
                Cacheability::NotCacheable(PassThrough::Method)
            );
        }
        assert_eq!(
            classify(&Method::HEAD, StatusCode::OK, None),
            Cacheability::Cacheable(None)
        );
    }

    #[test]
    fn test_classify_status() {
        for status in [StatusCode::OK, StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED, StatusCode::NOT_FOUND] {
            assert_eq!(classify(&Method::GET, status, None), Cacheability::Cacheable(None));
        }
        for status in [
            StatusCode::MOVED_PERMANENTLY,
            StatusCode::FOUND,
            StatusCode::BAD_REQUEST,
            StatusCode::GONE,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert_eq!(
                classify(&Method::GET, status, None),
                Cacheability::NotCacheable(PassThrough::Status)
            );
        }
    }

    #[test]
    fn test_classify_existing_policy() {
        let check = |cc: &'static str| {
            classify(&Method::GET, StatusCode::OK, Some(&HeaderValue::from_static(cc)))
        };
        assert_eq!(check(""), Cacheability::Cacheable(None));
        assert_eq!(check("public"), Cacheability::Cacheable(Some("public".into())));
        assert_eq!(check("private"), Cacheability::Cacheable(Some("private".into())));
        assert_eq!(check("no-store"), Cacheability::NotCacheable(PassThrough::ExplicitPolicy));
        assert_eq!(check("public, max-age=60"), Cacheability::NotCacheable(PassThrough::ExplicitPolicy));
        assert_eq!(check("Public"), Cacheability::NotCacheable(PassThrough::ExplicitPolicy));

        let opaque = HeaderValue::from_bytes(b"\xffpublic").unwrap();
        assert_eq!(
            classify(&Method::GET, StatusCode::OK, Some(&opaque)),
            Cacheability::NotCacheable(PassThrough::ExplicitPolicy)
        );
    }

    #[test]
    fn test_cache_control_value() {
        assert_eq!(cache_control_value(None, 900, -1), "public, s-maxage=900, max-age=900");
        assert_eq!(
            cache_control_value(Some("private"), 30, -1),
            "private, s-maxage=30, max-age=30"
        );
        assert_eq!(
            cache_control_value(None, 10, 0),
            "public, s-maxage=10, max-age=10, stale-while-revalidate=0"
        );
        assert_eq!(
            cache_control_value(Some("public"), 10, 60),
            "public, s-maxage=10, max-age=10, stale-while-revalidate=60"
        );
    }

    #[tokio::test]
    async fn test_decorates_cacheable_response() {
        let (decorator, _) = decorator(-1);
        let res = decorator
            .decorate(&Method::GET, "/img/logo.png", upstream(StatusCode::OK, None))
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CACHE_CONTROL], "public, s-maxage=9999, max-age=9999");
        assert_eq!(res.headers()["x-upstream"], "babbage");

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("<html></html>"));
    }

    #[tokio::test]
    async fn test_keeps_private_and_appends_swr() {
        let (decorator, _) = decorator(15);
        let res = decorator
            .decorate(
                &Method::GET,
                "/economy",
                upstream(StatusCode::NOT_FOUND, Some("private")),
            )
            .await;
        assert_eq!(
            res.headers()[CACHE_CONTROL],
            "private, s-maxage=100, max-age=100, stale-while-revalidate=15"
        );
    }

    #[tokio::test]
    async fn test_no_store_passes_through_without_lookup() {
        let (decorator, source) = decorator(-1);
        let res = decorator
            .decorate(&Method::GET, "/economy", upstream(StatusCode::OK, Some("no-store")))
            .await;
        assert_eq!(res.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_passes_through() {
        let (decorator, source) = decorator(-1);
        let res = decorator
            .decorate(&Method::POST, "/economy", upstream(StatusCode::OK, None))
            .await;
        assert!(res.headers().get(CACHE_CONTROL).is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_status_passes_through() {
        let (decorator, source) = decorator(-1);
        let res = decorator
            .decorate(
                &Method::GET,
                "/economy",
                upstream(StatusCode::INTERNAL_SERVER_ERROR, Some("public")),
            )
            .await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.headers()[CACHE_CONTROL], "public");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_copy_body_rechunks_large_frames() {
        let payload = Bytes::from(vec![7u8; COPY_CHUNK_SIZE * 2 + 10]);
        let mut body = CopyBody::new(Full::new(payload.clone()));

        let mut sizes = Vec::new();
        let mut total = Vec::new();
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            sizes.push(data.len());
            total.extend_from_slice(&data);
        }

        assert_eq!(sizes, vec![COPY_CHUNK_SIZE, COPY_CHUNK_SIZE, 10]);
        assert_eq!(Bytes::from(total), payload);
    }

    #[tokio::test]
    async fn test_copy_body_surfaces_stream_errors() {
        struct Broken;
        impl Body for Broken {
            type Data = Bytes;
            type Error = ProxyError;
            fn poll_frame(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
                Poll::Ready(Some(Err(ProxyError::UpstreamBodyCopy("reset".into()))))
            }
        }

        let err = CopyBody::new(Broken).collect().await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamBodyCopy(_)));
    }
}
