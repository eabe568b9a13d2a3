//! Helios
//!
//! Streaming observability pipeline: external services emit structured log
//! events; Helios ingests them over HTTP, publishes them to a partitioned
//! durable log keyed by service, stores them in a time-partitioned store,
//! and in parallel scores per-service 5-minute windows with an
//! isolation-forest model to detect anomalies.
//!
//! # Components
//!
//! - **Event model & codec** ([`schemas::events`]): canonical event shape,
//!   validation, enrichment, JSON wire format.
//! - **Log client adapter** ([`log_client`]): producer and consumer-group
//!   abstraction over the event log.
//! - **Ingestion service** ([`ingest`]): HTTP surface; 202 means the log
//!   has durably acknowledged the event.
//! - **Storage writer** ([`storage`]): consumer group into batched
//!   transactional inserts, offsets committed after the transaction.
//! - **Detector** ([`detector`]): consumer group into per-service sliding
//!   windows, feature extraction, model scoring, severity classification,
//!   alert dedup, and anomaly publication.
//!
//! Ordering holds within one log partition (one service); the storage
//! writer and detector consume the same partitions under distinct consumer
//! groups, so their progress is independent.

pub mod common;
pub mod database;
pub mod detector;
pub mod error;
pub mod ingest;
pub mod log_client;
pub mod storage;

pub mod schemas {
    //! Wire and storage schemas for events and anomaly records.

    pub mod anomalies;
    pub mod events;
}

// Re-export commonly used types at the crate root
pub use common::config::HeliosConfig;
pub use error::{PipelineError, ValidationError};
pub use schemas::anomalies::{AnomalyRecord, AnomalySeverity, FeatureVector};
pub use schemas::events::{Level, LogEvent};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(!VERSION.is_empty());
    }
}
