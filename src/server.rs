//! Inbound HTTP server.
//!
//! Accepts TCP connections under the connection cap, serves each
//! connection on its own task with hyper's auto (HTTP/1 + HTTP/2) builder and
//! drains in-flight connections once the shutdown token is cancelled.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::lifecycle::{ConnectionTracker, DrainResult};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Listener-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Cap on concurrent connections; 0 disables the cap.
    pub max_connections: usize,
    /// Deadline for a client to send complete request headers.
    pub header_read_timeout: Duration,
    /// How long open connections may take to finish after shutdown.
    pub graceful_shutdown_timeout: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_connections: config.http_max_connections,
            header_read_timeout: config.read_timeout,
            graceful_shutdown_timeout: config.graceful_shutdown_timeout,
        }
    }
}

/// Run the accept loop until `shutdown` is cancelled, then drain.
pub async fn serve<S, B>(
    listener: TcpListener,
    service: S,
    settings: ServerSettings,
    shutdown: CancellationToken,
) -> DrainResult
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = ProxyError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let tracker = ConnectionTracker::new();
    let semaphore = (settings.max_connections > 0)
        .then(|| Arc::new(Semaphore::new(settings.max_connections)));

    loop {
        // Above the cap, stop accepting; new clients wait in the listen backlog.
        let permit = match &semaphore {
            Some(semaphore) => {
                if semaphore.available_permits() == 0 {
                    debug!(
                        max_connections = settings.max_connections,
                        "Connection cap reached, waiting for a free slot"
                    );
                }
                tokio::select! {
                    acquired = semaphore.clone().acquire_owned() => match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = shutdown.cancelled() => {
                        info!("Shutdown signal received, stopping new connections");
                        break;
                    }
                }
            }
            None => None,
        };

        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let Some(guard) = tracker.track() else {
                            continue;
                        };

                        if let Err(e) = configure_tcp_stream(&stream) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service = service.clone();
                        let conn_shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, service, settings, conn_shutdown).await;
                            drop(guard);
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    tracker.begin_shutdown();
    info!(
        active_connections = tracker.active_count(),
        drain_timeout_secs = settings.graceful_shutdown_timeout.as_secs(),
        "Waiting for active connections to drain"
    );

    tracker.drain(settings.graceful_shutdown_timeout).await
}

/// Serve one connection until it closes or shutdown completes.
async fn handle_connection<S, B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    settings: ServerSettings,
    shutdown: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = Response<B>, Error = ProxyError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            let result: Result<_, std::convert::Infallible> = match svc.call(req).await {
                Ok(response) => Ok(response.map(|body| {
                    body.map_err(|e| -> BoxError { e.into() }).boxed()
                })),
                Err(e) => {
                    error!(error = %e, "Service error");
                    Ok(e.to_response()
                        .map(|body| body.map_err(|e| match e {}).boxed()))
                }
            };
            result
        }
    });

    let mut builder = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.header_read_timeout);
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);

    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                warn!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown.cancelled() => {
            info!(peer = %peer_addr, "Shutdown signal received, gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(settings.graceful_shutdown_timeout, conn).await;
        }
    }
}

fn configure_tcp_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}
