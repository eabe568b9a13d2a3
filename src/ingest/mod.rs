//! Ingestion Service
//!
//! HTTP front-end of the write path: decode → validate → enrich → encode →
//! publish, with the contract that a 202 is only returned once the log has
//! durably acknowledged the event. Validation failures are the caller's
//! problem (400); log unavailability is ours (503, retry later).

pub mod metrics;
pub mod routes;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::log_client::EventPublisher;
use metrics::IngestMetrics;

/// Outer bound on request handling, body read included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state across handlers. Requests are independent; the producer
/// handle and counters are the only shared pieces, both concurrency-safe.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<dyn EventPublisher>,
    pub metrics: Arc<IngestMetrics>,
    /// Identity of this ingestion node, stamped into every accepted event.
    pub host: String,
    pub events_topic: String,
}

/// Build the public API router. Metrics are served from a separate port
/// (see `common::serve_metrics`), not from this surface.
pub fn app(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/v1/events", post(routes::ingest_event))
        .route("/api/v1/events/batch", post(routes::ingest_batch))
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
