//! Mock upstream services for integration testing.
//!
//! - [`MockUpstream`]: a content service (Babbage, release calendar, search
//!   controller) answering every path with a body naming itself
//! - [`MockCacheTimeApi`]: the cache-time service keyed by page-path hash

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use legacy_cache_proxy::cache_policy::cache_time_id;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Request as seen by a mock upstream.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub host: Option<String>,
}

/// Mock content service.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    name: String,
    cache_control: HashMap<String, String>,
    statuses: HashMap<String, StatusCode>,
    redirects: HashMap<String, String>,
}

#[derive(Debug)]
struct UpstreamState {
    name: String,
    cache_control: HashMap<String, String>,
    statuses: HashMap<String, StatusCode>,
    redirects: HashMap<String, String>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockUpstream {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cache_control: HashMap::new(),
            statuses: HashMap::new(),
            redirects: HashMap::new(),
        }
    }

    /// Answer `path` with the given `Cache-Control` header.
    #[must_use]
    pub fn with_cache_control(mut self, path: &str, value: &str) -> Self {
        self.cache_control.insert(path.to_string(), value.to_string());
        self
    }

    /// Answer `path` with `status`.
    #[must_use]
    pub fn with_status(mut self, path: &str, status: StatusCode) -> Self {
        self.statuses.insert(path.to_string(), status);
        self
    }

    /// Answer `path` with a 301 to `location`.
    #[must_use]
    pub fn with_redirect(mut self, path: &str, location: &str) -> Self {
        self.redirects.insert(path.to_string(), location.to_string());
        self
    }

    /// Start the server and return its base URL and handle.
    pub async fn start(self) -> (String, MockServerHandle) {
        let state = Arc::new(UpstreamState {
            name: self.name,
            cache_control: self.cache_control,
            statuses: self.statuses,
            redirects: self.redirects,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(handle_content)
            .with_state(state.clone());

        let (base_url, handle) = spawn(app).await;
        (
            base_url,
            MockServerHandle {
                state,
                _handle: handle,
            },
        )
    }
}

/// Handle to a running [`MockUpstream`].
pub struct MockServerHandle {
    state: Arc<UpstreamState>,
    _handle: JoinHandle<()>,
}

impl MockServerHandle {
    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn handle_content(State(state): State<Arc<UpstreamState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    state.requests.lock().unwrap().push(RecordedRequest {
        method: req.method().to_string(),
        uri: req.uri().to_string(),
        host: req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    if let Some(location) = state.redirects.get(&path) {
        return (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, location.clone())],
        )
            .into_response();
    }

    let status = state.statuses.get(&path).copied().unwrap_or(StatusCode::OK);
    let mut response = (status, format!("{}:{}", state.name, path)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&state.name) {
        headers.insert("x-served-by", value);
    }
    if let Some(cc) = state.cache_control.get(&path)
        && let Ok(value) = HeaderValue::from_str(cc)
    {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

/// Canned cache-time service answer.
#[derive(Debug, Clone)]
pub enum CacheTimeRecord {
    Release(Option<DateTime<Utc>>),
    Status(StatusCode),
    Raw(String),
}

/// Mock cache-time service. Unknown ids answer 404.
#[derive(Debug, Clone, Default)]
pub struct MockCacheTimeApi {
    records: HashMap<String, CacheTimeRecord>,
}

#[derive(Debug)]
struct CacheTimeState {
    records: HashMap<String, CacheTimeRecord>,
    requested: Mutex<Vec<String>>,
}

impl MockCacheTimeApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a record for `page_path` with an optional release time.
    #[must_use]
    pub fn with_release(mut self, page_path: &str, release_time: Option<DateTime<Utc>>) -> Self {
        self.records
            .insert(cache_time_id(page_path), CacheTimeRecord::Release(release_time));
        self
    }

    /// Answer lookups for `page_path` with `status`.
    #[must_use]
    pub fn with_status(mut self, page_path: &str, status: StatusCode) -> Self {
        self.records
            .insert(cache_time_id(page_path), CacheTimeRecord::Status(status));
        self
    }

    /// Answer lookups for `page_path` with a raw 200 body.
    #[must_use]
    pub fn with_raw_body(mut self, page_path: &str, body: &str) -> Self {
        self.records
            .insert(cache_time_id(page_path), CacheTimeRecord::Raw(body.to_string()));
        self
    }

    pub async fn start(self) -> (String, CacheTimeApiHandle) {
        let state = Arc::new(CacheTimeState {
            records: self.records,
            requested: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/cache-times/{id}", get(handle_cache_time))
            .with_state(state.clone());

        let (base_url, handle) = spawn(app).await;
        (
            base_url,
            CacheTimeApiHandle {
                state,
                _handle: handle,
            },
        )
    }
}

/// Handle to a running [`MockCacheTimeApi`].
pub struct CacheTimeApiHandle {
    state: Arc<CacheTimeState>,
    _handle: JoinHandle<()>,
}

impl CacheTimeApiHandle {
    pub fn request_count(&self) -> usize {
        self.state.requested.lock().unwrap().len()
    }

    /// Ids looked up so far, in order.
    pub fn requested_ids(&self) -> Vec<String> {
        self.state.requested.lock().unwrap().clone()
    }
}

async fn handle_cache_time(
    State(state): State<Arc<CacheTimeState>>,
    Path(id): Path<String>,
) -> Response {
    state.requested.lock().unwrap().push(id.clone());

    match state.records.get(&id) {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(CacheTimeRecord::Status(status)) => (*status).into_response(),
        Some(CacheTimeRecord::Raw(body)) => (StatusCode::OK, body.clone()).into_response(),
        Some(CacheTimeRecord::Release(release_time)) => Json(json!({
            "id": id,
            "path": "ignored",
            "release_time": release_time.map(|t| t.to_rfc3339()),
        }))
        .into_response(),
    }
}

async fn spawn(app: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}
