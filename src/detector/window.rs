//! Per-service sliding windows.
//!
//! Events fold into 5-minute aligned bucket accumulators keyed by
//! `(service, bucket_start)`. A bucket closes when a later bucket for the
//! same service sees an event, or when the periodic sweep finds its end
//! older than the allowed skew. Closed buckets leave the store immediately,
//! which is what makes scoring idempotent per bucket.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::schemas::events::{Level, LogEvent};

/// Running aggregate for one `(service, bucket)` pair.
#[derive(Debug, Clone)]
pub struct BucketAccumulator {
    pub event_count: usize,
    pub latencies: Vec<f64>,
    pub error_count: usize,
    pub critical_count: usize,
    pub endpoints: HashSet<String>,
    pub first_event_at: DateTime<Utc>,
}

impl BucketAccumulator {
    fn new(first_event_at: DateTime<Utc>) -> Self {
        Self {
            event_count: 0,
            latencies: Vec::new(),
            error_count: 0,
            critical_count: 0,
            endpoints: HashSet::new(),
            first_event_at,
        }
    }

    fn fold(&mut self, event: &LogEvent) {
        self.event_count += 1;
        if let Some(latency) = event.latency_ms() {
            self.latencies.push(latency);
        }
        match event.parsed_level() {
            Some(Level::Error) => self.error_count += 1,
            Some(Level::Critical) => self.critical_count += 1,
            _ => {}
        }
        if let Some(endpoint) = event.endpoint() {
            self.endpoints.insert(endpoint.to_string());
        }
    }
}

/// A bucket removed from the store, ready for scoring.
#[derive(Debug, Clone)]
pub struct ClosedBucket {
    pub service: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub accumulator: BucketAccumulator,
}

/// Result of folding one event: buckets that closed because a later bucket
/// now exists, plus how many overflow buckets the per-service cap evicted.
#[derive(Debug, Default)]
pub struct Drained {
    pub closed: Vec<ClosedBucket>,
    pub evicted: usize,
}

/// Keyed window state for all services this replica owns. The consumer
/// loop is the single writer; the map only needs to survive concurrent
/// metric scrapes.
pub struct WindowStore {
    window_secs: i64,
    max_buckets_per_service: usize,
    services: DashMap<String, BTreeMap<i64, BucketAccumulator>>,
}

impl WindowStore {
    pub fn new(window_size: Duration, max_buckets_per_service: usize) -> Self {
        Self {
            window_secs: window_size.as_secs().max(1) as i64,
            max_buckets_per_service: max_buckets_per_service.max(1),
            services: DashMap::new(),
        }
    }

    /// Aligned bucket start for an event time: `t - (t mod window)`.
    pub fn bucket_start(&self, t: DateTime<Utc>) -> i64 {
        let secs = t.timestamp();
        secs - secs.rem_euclid(self.window_secs)
    }

    fn instant(&self, epoch_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch_secs, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Fold an event into its bucket, then close every earlier bucket for
    /// that service. Events without a timestamp or service cannot be
    /// bucketed and are ignored.
    pub fn observe(&self, event: &LogEvent) -> Drained {
        let mut drained = Drained::default();

        let Some(timestamp) = event.timestamp else {
            return drained;
        };
        if event.service.is_empty() {
            return drained;
        }

        let bucket = self.bucket_start(timestamp);
        let mut buckets = self.services.entry(event.service.clone()).or_default();

        buckets
            .entry(bucket)
            .or_insert_with(|| BucketAccumulator::new(timestamp))
            .fold(event);

        // An event in a later bucket is the signal that earlier buckets for
        // this service are complete.
        let earlier: Vec<i64> = buckets.range(..bucket).map(|(start, _)| *start).collect();
        for start in earlier {
            if let Some(accumulator) = buckets.remove(&start) {
                drained.closed.push(self.closed(&event.service, start, accumulator));
            }
        }

        // Cap per-service growth; the oldest open buckets age out unscored.
        while buckets.len() > self.max_buckets_per_service {
            if buckets.pop_first().is_none() {
                break;
            }
            drained.evicted += 1;
        }

        drained
    }

    /// Force-close every bucket whose end is older than `now - max_skew`.
    /// Driven by the periodic tick so quiet services still get scored.
    pub fn sweep(&self, now: DateTime<Utc>, max_skew: Duration) -> Vec<ClosedBucket> {
        let cutoff = now.timestamp() - max_skew.as_secs() as i64;
        let mut closed = Vec::new();

        for mut entry in self.services.iter_mut() {
            let service = entry.key().clone();
            let buckets = entry.value_mut();

            let expired: Vec<i64> = buckets
                .iter()
                .filter(|(start, _)| **start + self.window_secs <= cutoff)
                .map(|(start, _)| *start)
                .collect();

            for start in expired {
                if let Some(accumulator) = buckets.remove(&start) {
                    closed.push(self.closed(&service, start, accumulator));
                }
            }
        }

        self.services.retain(|_, buckets| !buckets.is_empty());
        closed
    }

    fn closed(&self, service: &str, start: i64, accumulator: BucketAccumulator) -> ClosedBucket {
        ClosedBucket {
            service: service.to_string(),
            start: self.instant(start),
            end: self.instant(start + self.window_secs),
            accumulator,
        }
    }

    /// Open buckets across all services; exposed for observability.
    pub fn open_buckets(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(300);

    fn event(service: &str, at: &str, level: &str) -> LogEvent {
        let mut event: LogEvent = serde_json::from_value(json!({
            "service": service,
            "level": level,
            "message": "m",
        }))
        .unwrap();
        event.timestamp = Some(at.parse().unwrap());
        event
    }

    fn event_with_latency(service: &str, at: &str, latency: f64) -> LogEvent {
        let mut e = event(service, at, "INFO");
        e.metadata = Some(json!({"latency_ms": latency, "endpoint": "/checkout"}));
        e
    }

    #[test]
    fn test_bucket_start_is_five_minute_aligned() {
        let store = WindowStore::new(WINDOW, 12);
        let t = "2026-03-01T12:03:27Z".parse().unwrap();
        let start = store.bucket_start(t);
        assert_eq!(start % 300, 0);
        let aligned = "2026-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(start, aligned.timestamp());
    }

    #[test]
    fn test_events_in_same_bucket_accumulate() {
        let store = WindowStore::new(WINDOW, 12);
        for _ in 0..3 {
            let drained = store.observe(&event("api", "2026-03-01T12:01:00Z", "INFO"));
            assert!(drained.closed.is_empty());
        }
        let drained = store.observe(&event("api", "2026-03-01T12:02:00Z", "ERROR"));
        assert!(drained.closed.is_empty());
        assert_eq!(store.open_buckets(), 1);
    }

    #[test]
    fn test_later_bucket_closes_earlier_one() {
        let store = WindowStore::new(WINDOW, 12);
        for _ in 0..4 {
            store.observe(&event_with_latency("api", "2026-03-01T12:01:00Z", 50.0));
        }
        store.observe(&event("api", "2026-03-01T12:03:00Z", "CRITICAL"));

        let drained = store.observe(&event("api", "2026-03-01T12:06:00Z", "INFO"));
        assert_eq!(drained.closed.len(), 1);

        let closed = &drained.closed[0];
        assert_eq!(closed.service, "api");
        assert_eq!(closed.accumulator.event_count, 5);
        assert_eq!(closed.accumulator.critical_count, 1);
        assert_eq!(closed.accumulator.latencies.len(), 4);
        assert!(closed.accumulator.endpoints.contains("/checkout"));
        assert_eq!(
            closed.start,
            "2026-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            closed.end,
            "2026-03-01T12:05:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_services_are_independent() {
        let store = WindowStore::new(WINDOW, 12);
        store.observe(&event("api", "2026-03-01T12:01:00Z", "INFO"));
        store.observe(&event("auth", "2026-03-01T12:01:00Z", "INFO"));

        // A later bucket for auth must not close api's bucket.
        let drained = store.observe(&event("auth", "2026-03-01T12:06:00Z", "INFO"));
        assert_eq!(drained.closed.len(), 1);
        assert_eq!(drained.closed[0].service, "auth");
        assert_eq!(store.open_buckets(), 2);
    }

    #[test]
    fn test_bucket_cap_evicts_oldest() {
        let store = WindowStore::new(WINDOW, 2);
        // Stragglers arriving in reverse order keep opening earlier buckets
        // without closing anything, which is what the cap guards against.
        store.observe(&event("api", "2026-03-01T12:11:00Z", "INFO"));
        let drained = store.observe(&event("api", "2026-03-01T12:06:00Z", "INFO"));
        assert!(drained.closed.is_empty());
        assert_eq!(drained.evicted, 0);

        let drained = store.observe(&event("api", "2026-03-01T12:01:00Z", "INFO"));
        assert!(drained.closed.is_empty());
        assert_eq!(drained.evicted, 1);
        assert_eq!(store.open_buckets(), 2);
    }

    #[test]
    fn test_sweep_closes_aged_buckets() {
        let store = WindowStore::new(WINDOW, 12);
        store.observe(&event("api", "2026-03-01T12:01:00Z", "INFO"));

        // Bucket ends 12:05; with 2 min skew it closes only after 12:07.
        let before = "2026-03-01T12:06:30Z".parse().unwrap();
        assert!(store.sweep(before, Duration::from_secs(120)).is_empty());

        let after = "2026-03-01T12:07:00Z".parse().unwrap();
        let closed = store.sweep(after, Duration::from_secs(120));
        assert_eq!(closed.len(), 1);
        assert_eq!(store.open_buckets(), 0);

        // Already removed; a second sweep finds nothing (scored at most once).
        assert!(store.sweep(after, Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn test_event_without_timestamp_is_ignored() {
        let store = WindowStore::new(WINDOW, 12);
        let mut e = event("api", "2026-03-01T12:01:00Z", "INFO");
        e.timestamp = None;
        let drained = store.observe(&e);
        assert!(drained.closed.is_empty());
        assert_eq!(store.open_buckets(), 0);
    }

    #[test]
    fn test_late_event_does_not_close_its_own_bucket() {
        let store = WindowStore::new(WINDOW, 12);
        store.observe(&event("api", "2026-03-01T12:06:00Z", "INFO"));
        // Straggler for the earlier bucket arrives after the later bucket
        // opened; it must not trigger a close of the later bucket.
        let drained = store.observe(&event("api", "2026-03-01T12:04:00Z", "INFO"));
        assert!(drained.closed.is_empty());
        assert_eq!(store.open_buckets(), 2);
    }
}
