//! Shared service runtime: tracing setup, metrics exposition, shutdown
//! signalling, and startup exit codes.

pub mod config;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tracing::info;

/// Startup exit codes. 0 is a clean shutdown.
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_STORE_UNREACHABLE: i32 = 3;
pub const EXIT_LOG_UNREACHABLE: i32 = 4;
pub const EXIT_MODEL_UNREADABLE: i32 = 5;

/// Log the startup failure and terminate with the given code. Used before
/// the service loop starts; once running, components retry instead of
/// exiting.
pub fn fail_startup(code: i32, context: &str, err: &dyn std::fmt::Display) -> ! {
    eprintln!("helios: {context}: {err}");
    std::process::exit(code);
}

/// Initialize the tracing subscriber from the configured level.
/// `RUST_LOG` still wins when set, for per-module filters in development.
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Prometheus text exposition for the process-wide registry.
async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Router for the dedicated metrics port: `/metrics` plus a liveness probe.
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(liveness_handler))
}

/// Serve the metrics router on its own port. Spawned alongside each
/// service's main loop.
pub async fn serve_metrics(port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Metrics listening on {addr}");
    axum::serve(listener, metrics_router()).await?;
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
