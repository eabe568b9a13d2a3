//! Storage Writer
//!
//! Consumes the events topic and commits rows to the time-series store in
//! batched transactions. Offsets advance only after their rows are durable,
//! so every delivered event lands in the store at least once.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use helios::common::{
    self, fail_startup, init_tracing, EXIT_CONFIG, EXIT_LOG_UNREACHABLE, EXIT_STORE_UNREACHABLE,
};
use helios::database::{Database, DatabaseConfig};
use helios::log_client::LogConsumer;
use helios::storage::{StorageMetrics, StorageWriter, StorageWriterConfig};
use helios::HeliosConfig;

const DEFAULT_GROUP: &str = "helios-storage-writer";

#[tokio::main]
async fn main() {
    let config = match HeliosConfig::from_env() {
        Ok(config) => config,
        Err(e) => fail_startup(EXIT_CONFIG, "configuration error", &e),
    };
    init_tracing(&config.log_level);

    info!("Starting Helios storage writer v{}", helios::VERSION);

    let metrics = match StorageMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => fail_startup(EXIT_CONFIG, "metrics registration failed", &e),
    };

    let db_config = DatabaseConfig {
        url: config.db_url(),
        ..DatabaseConfig::default()
    };
    let database = match Database::connect(&db_config).await {
        Ok(database) => Arc::new(database),
        Err(e) => fail_startup(EXIT_STORE_UNREACHABLE, "store unreachable at startup", &e),
    };
    if let Err(e) = database.initialize_schema().await {
        fail_startup(EXIT_STORE_UNREACHABLE, "schema initialization failed", &e);
    }

    let group = config.consumer_group_or(DEFAULT_GROUP);
    let consumer = match LogConsumer::new(&config, &group, &[&config.events_topic], DEFAULT_GROUP)
    {
        Ok(consumer) => Arc::new(consumer),
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

    let writer = StorageWriter::new(
        StorageWriterConfig::from_config(&config),
        Arc::clone(&database),
        metrics,
    );

    if let Err(e) = writer.run(consumer, shutdown_rx).await {
        error!("Storage writer failed: {e}");
        database.close().await;
        std::process::exit(1);
    }

    database.close().await;
    info!("Storage writer shutdown complete");
}
