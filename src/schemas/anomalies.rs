//! Anomaly Record Schema
//!
//! Output shape of the detector: the scored feature vector for one
//! `(service, window)` bucket plus the severity classification derived from
//! the model score and the window's error rate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of components in the feature vector; fixed by the model artifact.
pub const FEATURE_COUNT: usize = 12;

/// Discrete anomaly severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Low => "LOW",
            AnomalySeverity::Medium => "MEDIUM",
            AnomalySeverity::High => "HIGH",
            AnomalySeverity::Critical => "CRITICAL",
        }
    }

    /// Classification rules, evaluated in order; first match wins. More
    /// negative scores are more anomalous. `None` means no anomaly is
    /// emitted for this bucket.
    ///
    /// `threshold` is the configurable floor for the LOW tier; the higher
    /// tiers use fixed cutoffs so that raising the operator threshold never
    /// silences a severe incident.
    pub fn classify(score: f64, error_rate: f64, threshold: f64) -> Option<Self> {
        if score < -1.0 || error_rate > 0.50 {
            Some(AnomalySeverity::Critical)
        } else if score < -0.85 || error_rate > 0.30 {
            Some(AnomalySeverity::High)
        } else if score < -0.70 || error_rate > 0.15 {
            Some(AnomalySeverity::Medium)
        } else if score < threshold {
            Some(AnomalySeverity::Low)
        } else {
            None
        }
    }
}

/// The 12-component numeric summary of one bucket. Field order here is the
/// model's input order; [`FeatureVector::as_array`] is the single place that
/// flattens it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    pub event_count: f64,
    pub error_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_std: f64,
    pub hour_of_day: f64,
    pub p95_p50_ratio: f64,
    pub p99_p95_ratio: f64,
    pub error_count: f64,
    pub log_event_count: f64,
    pub log_error_rate: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.event_count,
            self.error_rate,
            self.p50_latency_ms,
            self.p95_latency_ms,
            self.p99_latency_ms,
            self.latency_std,
            self.hour_of_day,
            self.p95_p50_ratio,
            self.p99_p95_ratio,
            self.error_count,
            self.log_event_count,
            self.log_error_rate,
        ]
    }

    /// Component names in model input order, as carried by the artifact.
    pub fn names() -> [&'static str; FEATURE_COUNT] {
        [
            "event_count",
            "error_rate",
            "p50_latency_ms",
            "p95_latency_ms",
            "p99_latency_ms",
            "latency_std",
            "hour_of_day",
            "p95_p50_ratio",
            "p99_p95_ratio",
            "error_count",
            "log_event_count",
            "log_error_rate",
        ]
    }
}

/// An anomaly detected for one service window, published to the alerts
/// topic keyed by service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyRecord {
    pub anomaly_id: Uuid,

    /// End of the window that produced the score.
    pub time: DateTime<Utc>,

    pub service: String,

    /// Model score; more negative = more anomalous.
    pub score: f64,

    /// Score cutoff in force when the anomaly was detected.
    pub threshold: f64,

    pub severity: AnomalySeverity,

    /// The exact feature vector that produced the score.
    pub features: FeatureVector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub is_resolved: bool,
}
