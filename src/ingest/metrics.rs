//! Prometheus metric families for the ingestion surface.

use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, HistogramVec,
    IntCounter,
};

pub struct IngestMetrics {
    /// Outcome per event: accepted (durably acked), rejected (validation),
    /// failed (log unavailable).
    pub events_ingested: CounterVec,
    pub ingestion_latency: HistogramVec,
    pub producer_errors: IntCounter,
}

impl IngestMetrics {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            events_ingested: register_counter_vec!(
                "events_ingested_total",
                "Events handled by the ingestion service",
                &["service", "level", "status"]
            )?,
            ingestion_latency: register_histogram_vec!(
                "ingestion_latency_seconds",
                "Request handling latency",
                &["endpoint"]
            )?,
            producer_errors: register_int_counter!(
                "log_producer_errors_total",
                "Produce requests that failed after bounded retries"
            )?,
        })
    }

    pub fn observe_accepted(&self, service: &str, level: &str) {
        self.events_ingested
            .with_label_values(&[service, level, "accepted"])
            .inc();
    }

    pub fn observe_rejected(&self, service: &str, level: &str) {
        self.events_ingested
            .with_label_values(&[service, level, "rejected"])
            .inc();
    }

    pub fn observe_failed(&self, service: &str, level: &str) {
        self.events_ingested
            .with_label_values(&[service, level, "failed"])
            .inc();
    }
}
