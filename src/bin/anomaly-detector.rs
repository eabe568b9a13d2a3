//! Anomaly Detector
//!
//! Consumes the events topic in parallel with the storage writer (distinct
//! consumer group), maintains per-service 5-minute windows, scores closed
//! windows with the isolation-forest artifact, and publishes anomaly
//! records to the alerts topic.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use helios::common::{
    self, fail_startup, init_tracing, EXIT_CONFIG, EXIT_LOG_UNREACHABLE, EXIT_MODEL_UNREADABLE,
};
use helios::detector::model::IsolationForest;
use helios::detector::{Detector, DetectorConfig, DetectorMetrics};
use helios::log_client::{EventPublisher, LogConsumer, LogProducer};
use helios::HeliosConfig;

const DEFAULT_GROUP: &str = "helios-detector";

#[tokio::main]
async fn main() {
    let config = match HeliosConfig::from_env() {
        Ok(config) => config,
        Err(e) => fail_startup(EXIT_CONFIG, "configuration error", &e),
    };
    init_tracing(&config.log_level);

    info!("Starting Helios anomaly detector v{}", helios::VERSION);

    let metrics = match DetectorMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => fail_startup(EXIT_CONFIG, "metrics registration failed", &e),
    };

    let model = match IsolationForest::load(Path::new(&config.model_path)) {
        Ok(model) => model,
        Err(e) => fail_startup(EXIT_MODEL_UNREADABLE, "model artifact unreadable", &e),
    };

    let producer = match LogProducer::new(&config, DEFAULT_GROUP) {
        Ok(producer) => Arc::new(producer) as Arc<dyn EventPublisher>,
        Err(e) => fail_startup(EXIT_LOG_UNREACHABLE, "log producer setup failed", &e),
    };

    let group = config.consumer_group_or(DEFAULT_GROUP);
    let consumer = match LogConsumer::new(&config, &group, &[&config.events_topic], DEFAULT_GROUP)
    {
        Ok(consumer) => consumer,
        Err(e) => fail_startup(EXIT_LOG_UNREACHABLE, "log consumer setup failed", &e),
    };
    if !consumer.is_reachable(&config.events_topic).await {
        fail_startup(
            EXIT_LOG_UNREACHABLE,
            "event log unreachable at startup",
            &config.log_brokers,
        );
    }

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = common::serve_metrics(metrics_port).await {
            error!("Metrics server failed: {e}");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        common::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let detector = Detector::new(
        DetectorConfig::from_config(&config),
        model,
        producer,
        metrics,
    );

    if let Err(e) = detector.run(&consumer, shutdown_rx).await {
        error!("Detector failed: {e}");
        std::process::exit(1);
    }

    info!("Detector shutdown complete");
}
