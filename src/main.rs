//! Legacy cache proxy - sets `Cache-Control` lifetimes in front of the legacy
//! publishing platform.
//!
//! Configuration is read from the environment (see `ProxyConfig::from_env`);
//! command-line flags override the listen address and allow a dry-run
//! configuration check.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use legacy_cache_proxy::config::{ProxyConfig, format_duration};
use legacy_cache_proxy::lifecycle::DrainResult;
use legacy_cache_proxy::logging_layer::logging_layer;
use legacy_cache_proxy::proxy_service::ProxyService;
use legacy_cache_proxy::server::{ServerSettings, serve};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address, overriding BIND_ADDR (e.g. ":29200" or "127.0.0.1:8081")
    #[arg(long)]
    bind_addr: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard must live for the whole program so buffered logs are flushed.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ProxyConfig::from_env();
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }

    if let Err(e) = config.validate() {
        error!(field = e.field(), error = %e, "Invalid configuration, refusing to start");
        return Err(e.into());
    }

    info!(
        bind_addr = %config.bind_addr,
        babbage_url = %config.babbage_url,
        release_calendar_url = %config.release_calendar_url,
        search_controller_url = %config.search_controller_url,
        enable_search_controller = config.enable_search_controller,
        legacy_cache_api_url = %config.legacy_cache_api_url,
        cache_time_default = %format_duration(config.cache_times.default),
        cache_time_errored = %format_duration(config.cache_times.errored),
        cache_time_long = %format_duration(config.cache_times.long),
        cache_time_short = %format_duration(config.cache_times.short),
        enable_publish_expiry_offset = config.cache_times.enable_publish_expiry_offset,
        publish_expiry_offset = %format_duration(config.cache_times.publish_expiry_offset),
        enable_max_age_countdown = config.cache_times.enable_max_age_countdown,
        stale_while_revalidate_seconds = config.stale_while_revalidate_seconds,
        read_timeout = %format_duration(config.read_timeout),
        write_timeout = %format_duration(config.write_timeout),
        http_max_connections = config.http_max_connections,
        "Configuration loaded"
    );

    if cli.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let proxy_service = ProxyService::from_config(&config)?;
    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(proxy_service);

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Legacy cache proxy listening");

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    match serve(
        listener,
        service_stack,
        ServerSettings::from_config(&config),
        shutdown,
    )
    .await
    {
        DrainResult::Complete => {
            info!("All connections drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => Err(format!(
            "Drain timeout exceeded with {} remaining connections",
            remaining
        )
        .into()),
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = shutdown;
}
