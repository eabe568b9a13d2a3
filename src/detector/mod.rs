//! Anomaly Detector
//!
//! Second consumer of the events topic. Folds each event into its service's
//! current 5-minute bucket, scores closed buckets with the isolation-forest
//! artifact, classifies severity from score and error rate, deduplicates
//! per-service alerts, and republishes anomaly records to the alerts topic.
//!
//! Alerting is best-effort: a bucket that fails inference or publishing is
//! logged and dropped rather than stalling consumption.

pub mod dedup;
pub mod features;
pub mod model;
pub mod window;

use chrono::Utc;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, register_int_counter_vec,
    CounterVec, Histogram, IntCounter, IntCounterVec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::config::HeliosConfig;
use crate::error::PipelineError;
use crate::log_client::{EventPublisher, LogConsumer};
use crate::schemas::anomalies::{AnomalyRecord, AnomalySeverity};
use crate::schemas::events::parse;

use dedup::AlertDeduper;
use model::IsolationForest;
use window::{ClosedBucket, Drained, WindowStore};

pub struct DetectorMetrics {
    pub events_consumed: IntCounter,
    pub decode_errors: IntCounter,
    pub buckets_scored: IntCounter,
    pub buckets_skipped: IntCounterVec,
    pub anomalies_emitted: CounterVec,
    pub alerts_suppressed: IntCounter,
    pub model_errors: IntCounter,
    pub publish_errors: IntCounter,
    pub scoring_duration: Histogram,
}

impl DetectorMetrics {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            events_consumed: register_int_counter!(
                "detector_events_consumed_total",
                "Events folded into windows"
            )?,
            decode_errors: register_int_counter!(
                "detector_decode_errors_total",
                "Log records that failed to decode as events"
            )?,
            buckets_scored: register_int_counter!(
                "detector_buckets_scored_total",
                "Closed buckets run through the model"
            )?,
            buckets_skipped: register_int_counter_vec!(
                "detector_buckets_skipped_total",
                "Closed buckets dropped without scoring",
                &["reason"]
            )?,
            anomalies_emitted: register_counter_vec!(
                "anomalies_emitted_total",
                "Anomaly records published to the alerts topic",
                &["severity"]
            )?,
            alerts_suppressed: register_int_counter!(
                "alerts_suppressed_total",
                "Anomalies suppressed by the per-service cooldown"
            )?,
            model_errors: register_int_counter!(
                "detector_model_errors_total",
                "Buckets skipped because inference failed"
            )?,
            publish_errors: register_int_counter!(
                "detector_publish_errors_total",
                "Anomaly records lost after publish retries"
            )?,
            scoring_duration: register_histogram!(
                "detector_scoring_duration_seconds",
                "Feature extraction plus model inference per bucket"
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub anomalies_topic: String,
    pub window_size: Duration,
    pub min_events: usize,
    pub threshold: f64,
    pub dedup_cooldown_seconds: u64,
    pub max_skew: Duration,
    pub sweep_interval: Duration,
    pub max_buckets_per_service: usize,
}

impl DetectorConfig {
    pub fn from_config(config: &HeliosConfig) -> Self {
        Self {
            anomalies_topic: config.anomalies_topic.clone(),
            window_size: Duration::from_secs(config.window_size_minutes * 60),
            min_events: config.min_events_per_window,
            threshold: config.anomaly_threshold,
            dedup_cooldown_seconds: config.dedup_cooldown_seconds,
            max_skew: Duration::from_secs(config.max_skew_seconds),
            sweep_interval: config.sweep_interval(),
            max_buckets_per_service: config.max_buckets_per_service,
        }
    }
}

pub struct Detector {
    config: DetectorConfig,
    windows: WindowStore,
    model: IsolationForest,
    deduper: AlertDeduper,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<DetectorMetrics>,
}

impl Detector {
    pub fn new(
        config: DetectorConfig,
        model: IsolationForest,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<DetectorMetrics>,
    ) -> Self {
        let windows = WindowStore::new(config.window_size, config.max_buckets_per_service);
        let deduper = AlertDeduper::new(config.dedup_cooldown_seconds);
        Self {
            config,
            windows,
            model,
            deduper,
            publisher,
            metrics,
        }
    }

    /// Consume the events topic until shutdown. Offsets commit after each
    /// record is folded; windows are in-memory only, so a restart replays
    /// uncommitted records and rebuilds them.
    pub async fn run(
        &self,
        consumer: &LogConsumer,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            window_secs = self.config.window_size.as_secs(),
            min_events = self.config.min_events,
            threshold = self.config.threshold,
            "Detector running"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Detector stopping; open windows will rebuild from redelivery");
                    return Ok(());
                }
                _ = sweep_tick.tick() => {
                    let closed = self.windows.sweep(Utc::now(), self.config.max_skew);
                    for bucket in closed {
                        self.score_bucket(bucket).await;
                    }
                }
                record = consumer.recv() => match record {
                    Ok(record) => {
                        self.handle_payload(&record.payload).await;
                        if let Err(e) = consumer.commit_record(&record) {
                            warn!("Offset commit failed: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("Consumer fetch failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Fold one raw log payload into the window state and score whatever
    /// buckets it closed.
    pub async fn handle_payload(&self, payload: &[u8]) {
        match parse(payload) {
            Ok(event) => {
                self.metrics.events_consumed.inc();
                let drained = self.windows.observe(&event);
                self.drain(drained).await;
            }
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!("Skipping undecodable log record: {e}");
            }
        }
    }

    async fn drain(&self, drained: Drained) {
        if drained.evicted > 0 {
            self.metrics
                .buckets_skipped
                .with_label_values(&["aged_out"])
                .inc_by(drained.evicted as u64);
        }
        for bucket in drained.closed {
            self.score_bucket(bucket).await;
        }
    }

    /// Score one closed bucket and publish an anomaly if it classifies.
    /// The bucket is gone from the store by the time this runs, so a bucket
    /// is scored at most once per process.
    pub async fn score_bucket(&self, bucket: ClosedBucket) {
        if bucket.accumulator.event_count < self.config.min_events {
            self.metrics
                .buckets_skipped
                .with_label_values(&["below_min_events"])
                .inc();
            return;
        }

        let timer = self.metrics.scoring_duration.start_timer();
        let features = features::extract(&bucket);
        let score = match self.model.score(&features) {
            Ok(score) => score,
            Err(e) => {
                timer.observe_duration();
                self.metrics.model_errors.inc();
                warn!(service = %bucket.service, "Model inference failed, skipping bucket: {e}");
                return;
            }
        };
        timer.observe_duration();
        self.metrics.buckets_scored.inc();

        debug!(
            service = %bucket.service,
            score,
            events = bucket.accumulator.event_count,
            "Bucket scored"
        );

        let Some(severity) =
            AnomalySeverity::classify(score, features.error_rate, self.config.threshold)
        else {
            return;
        };

        let now = Utc::now();
        if !self.deduper.should_emit(&bucket.service, now) {
            self.metrics.alerts_suppressed.inc();
            debug!(service = %bucket.service, "Alert suppressed by cooldown");
            return;
        }

        let record = AnomalyRecord {
            anomaly_id: Uuid::new_v4(),
            time: bucket.end,
            service: bucket.service.clone(),
            score,
            threshold: self.config.threshold,
            severity,
            features,
            confidence: Some((self.config.threshold - score).clamp(0.0, 1.0)),
            is_resolved: false,
        };

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize anomaly record: {e}");
                return;
            }
        };

        match self
            .publisher
            .publish(
                &self.config.anomalies_topic,
                record.service.as_bytes(),
                &payload,
                record.time,
            )
            .await
        {
            Ok(_) => {
                self.metrics
                    .anomalies_emitted
                    .with_label_values(&[severity.as_str()])
                    .inc();
                info!(
                    service = %record.service,
                    severity = severity.as_str(),
                    score,
                    error_rate = features.error_rate,
                    endpoints = bucket.accumulator.endpoints.len(),
                    "Anomaly emitted"
                );
            }
            Err(e) => {
                // Alerting is best-effort; losing one record beats stalling
                // the consumer.
                self.metrics.publish_errors.inc();
                error!(service = %record.service, "Dropping anomaly after publish retries: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_client::Ack;
    use crate::schemas::events::{encode, LogEvent};
    use async_trait::async_trait;
    use chrono::DateTime;
    use once_cell::sync::Lazy;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    static METRICS: Lazy<Arc<DetectorMetrics>> =
        Lazy::new(|| Arc::new(DetectorMetrics::new().unwrap()));

    #[derive(Default)]
    struct RecordingPublisher {
        fail: AtomicBool,
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            _key: &[u8],
            payload: &[u8],
            _timestamp: chrono::DateTime<Utc>,
        ) -> Result<Ack, PipelineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::TransientIo("broker down".into()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            Ok(Ack {
                partition: 0,
                offset: 0,
            })
        }

        async fn is_reachable(&self, _topic: &str) -> bool {
            !self.fail.load(Ordering::SeqCst)
        }
    }

    fn detector_config(cooldown: u64) -> DetectorConfig {
        DetectorConfig {
            anomalies_topic: "anomaly-alerts".to_string(),
            window_size: Duration::from_secs(300),
            min_events: 10,
            threshold: -0.70,
            dedup_cooldown_seconds: cooldown,
            max_skew: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            max_buckets_per_service: 12,
        }
    }

    fn test_model() -> IsolationForest {
        // One stump: everything lands in a populous leaf, so scores hover
        // near the offset and never cross the threshold on their own.
        IsolationForest::from_slice(
            json!({
                "format_version": 1,
                "feature_names": crate::schemas::anomalies::FeatureVector::names(),
                "scaler": {"mean": vec![0.0f64; 12], "std": vec![1.0f64; 12]},
                "offset": 0.5,
                "max_samples": 256,
                "trees": [
                    {"nodes": [
                        {"split": {"feature": 1, "threshold": 100.0, "left": 1, "right": 2}},
                        {"leaf": {"size": 256}},
                        {"leaf": {"size": 1}},
                    ]},
                ],
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    fn detector(publisher: Arc<RecordingPublisher>, cooldown: u64) -> Detector {
        Detector::new(
            detector_config(cooldown),
            test_model(),
            publisher,
            Arc::clone(&METRICS),
        )
    }

    fn payload(service: &str, at: &str, level: &str) -> Vec<u8> {
        let mut event: LogEvent = serde_json::from_value(json!({
            "service": service,
            "level": level,
            "message": "m",
        }))
        .unwrap();
        event.timestamp = Some(at.parse::<DateTime<Utc>>().unwrap());
        event.enrich("node-1", event.timestamp.unwrap());
        encode(&event).unwrap()
    }

    async fn feed_error_heavy_window(detector: &Detector, service: &str) {
        // 12 events, 8 errors: error_rate > 0.5 forces CRITICAL.
        for i in 0..12 {
            let level = if i < 8 { "ERROR" } else { "INFO" };
            detector
                .handle_payload(&payload(service, "2026-03-01T12:01:00Z", level))
                .await;
        }
        // Later bucket closes the window.
        detector
            .handle_payload(&payload(service, "2026-03-01T12:06:00Z", "INFO"))
            .await;
    }

    #[tokio::test]
    async fn test_error_heavy_window_emits_critical_anomaly() {
        let publisher = Arc::new(RecordingPublisher::default());
        let detector = detector(Arc::clone(&publisher), 600);

        feed_error_heavy_window(&detector, "payments").await;

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "anomaly-alerts");

        let record: AnomalyRecord = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(record.service, "payments");
        assert_eq!(record.severity, AnomalySeverity::Critical);
        assert!(record.features.event_count >= 10.0);
        assert!(record.features.error_rate > 0.5);
        assert_eq!(record.threshold, -0.70);
        assert!(!record.is_resolved);
        // Severity re-derives from the published score and error rate.
        assert_eq!(
            AnomalySeverity::classify(record.score, record.features.error_rate, record.threshold),
            Some(record.severity)
        );
    }

    #[tokio::test]
    async fn test_below_min_events_is_silent() {
        let publisher = Arc::new(RecordingPublisher::default());
        let detector = detector(Arc::clone(&publisher), 600);

        // 9 events, one an ERROR: under the 10-event floor.
        for i in 0..9 {
            let level = if i == 0 { "ERROR" } else { "INFO" };
            detector
                .handle_payload(&payload("auth", "2026-03-01T12:01:00Z", level))
                .await;
        }
        detector
            .handle_payload(&payload("auth", "2026-03-01T12:06:00Z", "INFO"))
            .await;

        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quiet_window_emits_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let detector = detector(Arc::clone(&publisher), 600);

        for _ in 0..15 {
            detector
                .handle_payload(&payload("api", "2026-03-01T12:01:00Z", "INFO"))
                .await;
        }
        detector
            .handle_payload(&payload("api", "2026-03-01T12:06:00Z", "INFO"))
            .await;

        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_alert() {
        let publisher = Arc::new(RecordingPublisher::default());
        let detector = detector(Arc::clone(&publisher), 600);

        feed_error_heavy_window(&detector, "payments").await;
        // Same pattern one window later, still inside the 10 min cooldown.
        for i in 0..12 {
            let level = if i < 8 { "ERROR" } else { "INFO" };
            detector
                .handle_payload(&payload("payments", "2026-03-01T12:06:30Z", level))
                .await;
        }
        detector
            .handle_payload(&payload("payments", "2026-03-01T12:11:00Z", "INFO"))
            .await;

        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_cooldown_lets_every_window_alert() {
        let publisher = Arc::new(RecordingPublisher::default());
        let detector = detector(Arc::clone(&publisher), 0);

        feed_error_heavy_window(&detector, "payments").await;
        for i in 0..12 {
            let level = if i < 8 { "ERROR" } else { "INFO" };
            detector
                .handle_payload(&payload("payments", "2026-03-01T12:06:30Z", level))
                .await;
        }
        detector
            .handle_payload(&payload("payments", "2026-03-01T12:11:00Z", "INFO"))
            .await;

        assert_eq!(publisher.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stall() {
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.fail.store(true, Ordering::SeqCst);
        let detector = detector(Arc::clone(&publisher), 600);

        feed_error_heavy_window(&detector, "payments").await;
        assert!(publisher.published.lock().unwrap().is_empty());

        // Recovery: the next anomalous service still alerts.
        publisher.fail.store(false, Ordering::SeqCst);
        feed_error_heavy_window(&detector, "checkout").await;
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_skipped() {
        let publisher = Arc::new(RecordingPublisher::default());
        let detector = detector(Arc::clone(&publisher), 600);
        detector.handle_payload(b"{broken").await;
        assert!(publisher.published.lock().unwrap().is_empty());
    }
}
