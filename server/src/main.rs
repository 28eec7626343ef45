//! Darecast Server - Main entry point.
//!
//! This binary starts the Darecast realtime gateway with:
//! - Structured JSON logging for production
//! - Optional Redis broker for cross-instance fanout and shared rate limits
//! - Background sweeps for idle rate buckets and expired sessions
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`darecast_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Single instance
//! DARECAST_PUBLISHER_TOKEN="secret" cargo run --bin darecast-server
//!
//! # Behind a proxy, several instances sharing Redis
//! DARECAST_BROKER_URL="redis://127.0.0.1:6379" \
//! DARECAST_HARDENING=true \
//! DARECAST_ALLOWED_ORIGINS="https://darecast.app" \
//! DARECAST_TRUST_PROXY=true \
//! PORT=8080 \
//! cargo run --release --bin darecast-server
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use darecast_server::bus::EventBus;
use darecast_server::config::Config;
use darecast_server::rate_limit::RateLimiter;
use darecast_server::routes::{create_router, AppState};

/// Cleanup interval for idle rate limiter buckets (30 seconds).
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Sweep interval for expired sessions (10 minutes).
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Common environment variables:");
            eprintln!("  PORT                           - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                       - Log level filter (default: info)");
            eprintln!("  DARECAST_PUBLISHER_TOKEN       - Bearer token for /internal routes");
            eprintln!("  DARECAST_BROKER_URL            - Redis URL for multi-instance fanout");
            eprintln!("  DARECAST_HARDENING             - Enforce origin allow-list and IP caps");
            eprintln!("  DARECAST_ALLOWED_ORIGINS       - Comma-separated origin allow-list");
            eprintln!("  DARECAST_WS_MESSAGE_RATE/BURST - Inbound frame limits");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        realtime_enabled = config.realtime_enabled,
        hardening = config.hardening,
        allowed_origin_count = config.allowed_origins.len(),
        broker_configured = config.broker_url.is_some(),
        trust_proxy = config.trust_proxy,
        "Darecast server starting"
    );

    let broker_url = config.broker_url.as_deref();
    let bus = EventBus::from_broker_url(broker_url).await;
    let rate_limiter = RateLimiter::connect(broker_url).await;
    if broker_url.is_some() && bus.fanout_name() == "local" {
        warn!("Running without cross-instance fanout");
    }
    info!(
        fanout = bus.fanout_name(),
        rate_limit_store = rate_limiter.store_name(),
        "Realtime components ready"
    );

    let state = AppState::with_components(config.clone(), bus, rate_limiter);

    let cleanup_handle = state
        .rate_limiter
        .spawn_cleanup_task(RATE_LIMITER_CLEANUP_INTERVAL);
    let sweep_handle = state.sessions.spawn_sweep_task(SESSION_SWEEP_INTERVAL);
    info!(
        rate_limiter_interval_secs = RATE_LIMITER_CLEANUP_INTERVAL.as_secs(),
        session_sweep_interval_secs = SESSION_SWEEP_INTERVAL.as_secs(),
        "Background cleanup tasks started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    cleanup_handle.abort();
    sweep_handle.abort();
    info!("Background cleanup tasks stopped");

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info,tower_http=debug`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT is received.
///
/// If a handler cannot be installed the failure is logged and that signal
/// is ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
