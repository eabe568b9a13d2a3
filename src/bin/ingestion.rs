//! Ingestion Service
//!
//! HTTP front-end of the Helios pipeline. Accepts single events and
//! batches, validates and enriches them, and publishes them to the events
//! topic keyed by service. A 202 is only returned once the log has durably
//! acknowledged the event.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use helios::common::{
    self, fail_startup, init_tracing, EXIT_CONFIG, EXIT_LOG_UNREACHABLE,
};
use helios::ingest::{self, metrics::IngestMetrics, AppState};
use helios::log_client::{EventPublisher, LogProducer};
use helios::HeliosConfig;

#[tokio::main]
async fn main() {
    let config = match HeliosConfig::from_env() {
        Ok(config) => config,
        Err(e) => fail_startup(EXIT_CONFIG, "configuration error", &e),
    };
    init_tracing(&config.log_level);

    info!("Starting Helios ingestion service v{}", helios::VERSION);

    let metrics = match IngestMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => fail_startup(EXIT_CONFIG, "metrics registration failed", &e),
    };

    let producer = match LogProducer::new(&config, "helios-ingestion") {
        Ok(producer) => Arc::new(producer),
        Err(e) => fail_startup(EXIT_LOG_UNREACHABLE, "log producer setup failed", &e),
    };
    if !producer.is_reachable(&config.events_topic).await {
        fail_startup(
            EXIT_LOG_UNREACHABLE,
            "event log unreachable at startup",
            &config.log_brokers,
        );
    }

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let state = AppState {
        publisher: Arc::<LogProducer>::clone(&producer) as Arc<dyn EventPublisher>,
        metrics,
        host,
        events_topic: config.events_topic.clone(),
    };
    let app = ingest::app(state, config.max_body_bytes);

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = common::serve_metrics(metrics_port).await {
            error!("Metrics server failed: {e}");
        }
    });

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => fail_startup(EXIT_CONFIG, "cannot bind server port", &e),
    };
    info!("Ingestion listening on {addr}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(common::shutdown_signal())
        .await
    {
        error!("Server error: {e}");
    }

    // In-flight requests have drained; push out whatever the producer still
    // holds before exiting.
    producer.flush(Duration::from_secs(30));
    info!("Ingestion service shutdown complete");
}
