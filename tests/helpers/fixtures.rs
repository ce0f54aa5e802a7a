//! Proxy configuration and start-up helpers for integration testing.
//!
//! TTL constants are distinct so each test can tell which branch fired.

#![allow(dead_code)]

use super::mock_upstream::{CacheTimeApiHandle, MockCacheTimeApi, MockServerHandle, MockUpstream};
use legacy_cache_proxy::config::{CacheTimes, ProxyConfig};
use legacy_cache_proxy::lifecycle::DrainResult;
use legacy_cache_proxy::logging_layer::logging_layer;
use legacy_cache_proxy::proxy_service::ProxyService;
use legacy_cache_proxy::server::{ServerSettings, serve};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;

pub const DEFAULT_TTL: u64 = 100;
pub const ERRORED_TTL: u64 = 50;
pub const LONG_TTL: u64 = 9999;
pub const SHORT_TTL: u64 = 3;

/// Proxy configuration pointing at the given upstreams.
#[must_use]
pub fn test_config(
    babbage: &str,
    release_calendar: &str,
    search_controller: &str,
    cache_api: &str,
) -> ProxyConfig {
    ProxyConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        babbage_url: babbage.to_string(),
        release_calendar_url: release_calendar.to_string(),
        search_controller_url: search_controller.to_string(),
        enable_search_controller: false,
        legacy_cache_api_url: cache_api.to_string(),
        cache_times: CacheTimes {
            default: Duration::from_secs(DEFAULT_TTL),
            errored: Duration::from_secs(ERRORED_TTL),
            long: Duration::from_secs(LONG_TTL),
            short: Duration::from_secs(SHORT_TTL),
            enable_publish_expiry_offset: false,
            publish_expiry_offset: Duration::from_secs(180),
            enable_max_age_countdown: true,
        },
        stale_while_revalidate_seconds: -1,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(10),
        http_max_connections: 0,
        graceful_shutdown_timeout: Duration::from_secs(2),
    }
}

/// A proxy running on an ephemeral port.
pub struct TestProxy {
    pub base_url: String,
    shutdown: CancellationToken,
    handle: JoinHandle<DrainResult>,
}

impl TestProxy {
    /// Cancel the accept loop and wait for the drain result.
    pub async fn stop(self) -> DrainResult {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let service = ServiceBuilder::new()
        .layer(logging_layer())
        .service(ProxyService::from_config(&config).unwrap());

    let listener = TcpListener::bind(config.socket_addr().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(serve(
        listener,
        service,
        ServerSettings::from_config(&config),
        shutdown.clone(),
    ));

    TestProxy {
        base_url: format!("http://{}", addr),
        shutdown,
        handle,
    }
}

/// HTTP client that, like a browser cache in front of the proxy, does not
/// follow redirects on its own.
#[must_use]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}

/// All four upstreams plus a running proxy.
pub struct Stack {
    pub babbage: MockServerHandle,
    pub release_calendar: MockServerHandle,
    pub search_controller: MockServerHandle,
    pub cache_api: CacheTimeApiHandle,
    pub proxy: TestProxy,
}

impl Stack {
    /// Start the mocks, then a proxy whose configuration `tweak` may adjust.
    pub async fn start(
        babbage: MockUpstream,
        cache_api: MockCacheTimeApi,
        tweak: impl FnOnce(&mut ProxyConfig),
    ) -> Self {
        let (babbage_url, babbage) = babbage.start().await;
        let (release_calendar_url, release_calendar) =
            MockUpstream::new("release-calendar").start().await;
        let (search_controller_url, search_controller) =
            MockUpstream::new("search-controller").start().await;
        let (cache_api_url, cache_api) = cache_api.start().await;

        let mut config = test_config(
            &babbage_url,
            &release_calendar_url,
            &search_controller_url,
            &cache_api_url,
        );
        tweak(&mut config);

        Self {
            babbage,
            release_calendar,
            search_controller,
            cache_api,
            proxy: start_proxy(config).await,
        }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.proxy.base_url, path_and_query)
    }
}
