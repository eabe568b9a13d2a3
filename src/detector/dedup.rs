//! Alert deduplication.
//!
//! One alert per service per cooldown window, tracked as the instant the
//! last alert was emitted. Suppressed alerts are counted by the caller.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

pub struct AlertDeduper {
    cooldown: Duration,
    last_alert: DashMap<String, DateTime<Utc>>,
}

impl AlertDeduper {
    pub fn new(cooldown_seconds: u64) -> Self {
        Self {
            cooldown: Duration::seconds(cooldown_seconds as i64),
            last_alert: DashMap::new(),
        }
    }

    /// Whether an alert for `service` may go out now. Emitting updates the
    /// per-service timestamp; suppression leaves it untouched.
    pub fn should_emit(&self, service: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.entry(service.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now - *entry.get() < self.cooldown {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_alert_emits() {
        let deduper = AlertDeduper::new(600);
        assert!(deduper.should_emit("api", at("2026-03-01T12:00:00Z")));
    }

    #[test]
    fn test_repeat_within_cooldown_suppressed() {
        let deduper = AlertDeduper::new(600);
        assert!(deduper.should_emit("api", at("2026-03-01T12:00:00Z")));
        assert!(!deduper.should_emit("api", at("2026-03-01T12:05:00Z")));
        assert!(!deduper.should_emit("api", at("2026-03-01T12:09:59Z")));
    }

    #[test]
    fn test_emits_again_after_cooldown() {
        let deduper = AlertDeduper::new(600);
        assert!(deduper.should_emit("api", at("2026-03-01T12:00:00Z")));
        assert!(deduper.should_emit("api", at("2026-03-01T12:10:00Z")));
    }

    #[test]
    fn test_suppression_does_not_extend_cooldown() {
        let deduper = AlertDeduper::new(600);
        assert!(deduper.should_emit("api", at("2026-03-01T12:00:00Z")));
        // A suppressed attempt at 12:09 must not push the next allowed
        // emission past 12:10.
        assert!(!deduper.should_emit("api", at("2026-03-01T12:09:00Z")));
        assert!(deduper.should_emit("api", at("2026-03-01T12:10:30Z")));
    }

    #[test]
    fn test_services_tracked_independently() {
        let deduper = AlertDeduper::new(600);
        assert!(deduper.should_emit("api", at("2026-03-01T12:00:00Z")));
        assert!(deduper.should_emit("auth", at("2026-03-01T12:00:01Z")));
    }

    #[test]
    fn test_zero_cooldown_disables_dedup() {
        let deduper = AlertDeduper::new(0);
        let t = at("2026-03-01T12:00:00Z");
        assert!(deduper.should_emit("api", t));
        assert!(deduper.should_emit("api", t));
    }
}
