//! Feature extraction.
//!
//! Turns one closed bucket into the fixed 12-component vector the model
//! scores. Extraction is pure: the same bucket always produces the same
//! vector, bit for bit.

use chrono::Timelike;
use statrs::statistics::Statistics;

use crate::schemas::anomalies::FeatureVector;

use super::window::ClosedBucket;

/// Percentile with linear interpolation on a sorted array. An empty array
/// yields 0 (no events carried a latency).
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        sorted[lower] + (rank - lower as f64) * (sorted[upper] - sorted[lower])
    }
}

pub fn extract(bucket: &ClosedBucket) -> FeatureVector {
    let accumulator = &bucket.accumulator;

    let event_count = accumulator.event_count as f64;
    let error_total = (accumulator.error_count + accumulator.critical_count) as f64;
    let error_rate = if accumulator.event_count == 0 {
        0.0
    } else {
        error_total / event_count
    };

    let mut sorted = accumulator.latencies.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let p50 = percentile(&sorted, 50.0);
    let p95 = percentile(&sorted, 95.0);
    let p99 = percentile(&sorted, 99.0);
    let latency_std = if sorted.len() < 2 {
        0.0
    } else {
        accumulator.latencies.iter().std_dev()
    };

    FeatureVector {
        event_count,
        error_rate,
        p50_latency_ms: p50,
        p95_latency_ms: p95,
        p99_latency_ms: p99,
        latency_std,
        hour_of_day: bucket.start.hour() as f64,
        p95_p50_ratio: p95 / p50.max(1.0),
        p99_p95_ratio: p99 / p95.max(1.0),
        error_count: (event_count * error_rate).round(),
        log_event_count: (1.0 + event_count).ln(),
        log_error_rate: (1.0 + error_rate).ln(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::window::WindowStore;
    use crate::schemas::events::LogEvent;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn bucket_from_events(events: Vec<LogEvent>) -> ClosedBucket {
        let store = WindowStore::new(Duration::from_secs(300), 12);
        for event in &events {
            store.observe(event);
        }
        let end_of_time = "2030-01-01T00:00:00Z".parse().unwrap();
        let mut closed = store.sweep(end_of_time, Duration::from_secs(0));
        assert_eq!(closed.len(), 1);
        closed.remove(0)
    }

    fn make_event(level: &str, latency: Option<f64>) -> LogEvent {
        let mut event: LogEvent = serde_json::from_value(json!({
            "service": "api",
            "level": level,
            "message": "m",
        }))
        .unwrap();
        event.timestamp = Some("2026-03-01T14:02:00Z".parse::<DateTime<Utc>>().unwrap());
        if let Some(l) = latency {
            event.metadata = Some(json!({"latency_ms": l}));
        }
        event
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 50.0), 25.0);
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
        // rank = 0.95 * 3 = 2.85 -> 30 + 0.85 * 10
        assert!((percentile(&sorted, 95.0) - 38.5).abs() < 1e-9);
        assert!((percentile(&sorted, 99.0) - 39.7).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_degenerate_inputs() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[7.5], 99.0), 7.5);
    }

    #[test]
    fn test_extract_counts_and_rates() {
        let mut events = vec![
            make_event("ERROR", Some(100.0)),
            make_event("CRITICAL", Some(200.0)),
        ];
        for _ in 0..8 {
            events.push(make_event("INFO", Some(50.0)));
        }

        let bucket = bucket_from_events(events);
        let features = extract(&bucket);

        assert_eq!(features.event_count, 10.0);
        assert_eq!(features.error_rate, 0.2);
        assert_eq!(features.error_count, 2.0);
        assert_eq!(features.hour_of_day, 14.0);
        assert_eq!(features.log_event_count, (11.0f64).ln());
        assert_eq!(features.log_error_rate, (1.2f64).ln());
    }

    #[test]
    fn test_extract_without_latencies_zeroes_latency_features() {
        let events = (0..10).map(|_| make_event("INFO", None)).collect();
        let bucket = bucket_from_events(events);
        let features = extract(&bucket);

        assert_eq!(features.p50_latency_ms, 0.0);
        assert_eq!(features.p95_latency_ms, 0.0);
        assert_eq!(features.p99_latency_ms, 0.0);
        assert_eq!(features.latency_std, 0.0);
        // Ratios stay finite because denominators floor at 1.
        assert_eq!(features.p95_p50_ratio, 0.0);
        assert_eq!(features.p99_p95_ratio, 0.0);
    }

    #[test]
    fn test_extract_is_pure() {
        let events = vec![
            make_event("INFO", Some(10.0)),
            make_event("ERROR", Some(5000.0)),
            make_event("INFO", Some(25.0)),
        ];
        let bucket = bucket_from_events(events);

        let a = extract(&bucket);
        let b = extract(&bucket);
        assert_eq!(a.as_array(), b.as_array());
    }

    #[test]
    fn test_ratio_denominator_floors_at_one() {
        let events = vec![
            make_event("INFO", Some(0.5)),
            make_event("INFO", Some(0.5)),
        ];
        let bucket = bucket_from_events(events);
        let features = extract(&bucket);
        // p50 = 0.5 < 1, so the ratio divides by 1 instead.
        assert_eq!(features.p95_p50_ratio, 0.5);
    }
}
