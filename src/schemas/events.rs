//! Log Event Schema & Codec
//!
//! Canonical shape of an ingested log event, plus the operations the write
//! path is built from: parse, validate, enrich, encode, partition key.
//! The wire format is JSON; the serialized form of an enriched event is the
//! exact payload published to the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ValidationError;

/// Upper bound on the `service` field, which doubles as the partition key.
pub const MAX_SERVICE_LEN: usize = 255;

/// Closed set of event severities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// ERROR and CRITICAL both count toward window error rates.
    pub fn is_error(&self) -> bool {
        matches!(self, Level::Error | Level::Critical)
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            _ => Err(()),
        }
    }
}

/// A structured log event emitted by an upstream service.
///
/// `level` stays a plain string here so validation can report an unknown
/// level as its own rejection reason rather than a JSON parse failure; the
/// closed set is enforced by [`LogEvent::validate`] and again by the store's
/// CHECK constraint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    /// Event time, UTC. Filled with the arrival instant when the caller
    /// omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Emitting service; also the log partition key.
    #[serde(default)]
    pub service: String,

    /// One of DEBUG | INFO | WARN | ERROR | CRITICAL.
    #[serde(default)]
    pub level: String,

    #[serde(default)]
    pub message: String,

    /// Free-form JSON object. Recognised keys: `latency_ms` (number),
    /// `endpoint` (string), `error_code` (string). Everything else passes
    /// through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Set by the ingestion service on acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,

    /// Ingestion node that accepted the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl LogEvent {
    /// Checks the rejection rules in their reporting order. The first
    /// failing constraint is the one the caller sees.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service.is_empty() {
            return Err(ValidationError::MissingField("service"));
        }
        if self.level.is_empty() {
            return Err(ValidationError::MissingField("level"));
        }
        if self.message.is_empty() {
            return Err(ValidationError::MissingField("message"));
        }
        let service_chars = self.service.chars().count();
        if service_chars > MAX_SERVICE_LEN {
            return Err(ValidationError::ServiceTooLong(service_chars));
        }
        if Level::from_str(&self.level).is_err() {
            return Err(ValidationError::UnknownLevel(self.level.clone()));
        }
        if let Some(metadata) = &self.metadata {
            if !metadata.is_object() {
                return Err(ValidationError::MetadataNotObject);
            }
        }
        Ok(())
    }

    /// Stamps the fields owned by the ingestion service. Caller-supplied
    /// timestamps survive; a missing timestamp becomes the arrival instant.
    pub fn enrich(&mut self, host: &str, now: DateTime<Utc>) {
        self.ingested_at = Some(now);
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
        self.host = Some(host.to_string());
    }

    /// The parsed level. `None` only before validation has passed.
    pub fn parsed_level(&self) -> Option<Level> {
        Level::from_str(&self.level).ok()
    }

    /// `metadata.latency_ms` as a number, when present.
    pub fn latency_ms(&self) -> Option<f64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("latency_ms"))
            .and_then(serde_json::Value::as_f64)
    }

    /// `metadata.endpoint` as a string, when present.
    pub fn endpoint(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("endpoint"))
            .and_then(serde_json::Value::as_str)
    }

    /// Partition key: UTF-8 bytes of `service`. Events for one service land
    /// on one partition, which is what gives per-service ordering.
    pub fn partition_key(&self) -> &[u8] {
        self.service.as_bytes()
    }
}

/// Decodes an event from a raw request or log payload.
pub fn parse(bytes: &[u8]) -> Result<LogEvent, ValidationError> {
    serde_json::from_slice(bytes).map_err(|e| ValidationError::MalformedJson(e.to_string()))
}

/// Canonical JSON of an enriched event; this is the log payload.
pub fn encode(event: &LogEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_event() -> LogEvent {
        parse(
            json!({
                "service": "api",
                "level": "INFO",
                "message": "request handled",
                "metadata": {"latency_ms": 42.5, "endpoint": "/users"}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = parse(b"{not json").unwrap_err();
        assert!(matches!(err, ValidationError::MalformedJson(_)));
    }

    #[test]
    fn test_validation_order() {
        let mut event = sample_event();
        event.service.clear();
        event.level.clear();
        // Missing service reported before missing level.
        assert_eq!(
            event.validate().unwrap_err(),
            ValidationError::MissingField("service")
        );

        let mut event = sample_event();
        event.message.clear();
        assert_eq!(
            event.validate().unwrap_err(),
            ValidationError::MissingField("message")
        );

        let mut event = sample_event();
        event.service = "s".repeat(256);
        assert_eq!(
            event.validate().unwrap_err(),
            ValidationError::ServiceTooLong(256)
        );

        let mut event = sample_event();
        event.level = "NOTICE".to_string();
        assert_eq!(
            event.validate().unwrap_err(),
            ValidationError::UnknownLevel("NOTICE".to_string())
        );

        let mut event = sample_event();
        event.metadata = Some(json!(["not", "an", "object"]));
        assert_eq!(
            event.validate().unwrap_err(),
            ValidationError::MetadataNotObject
        );
    }

    #[test]
    fn test_service_at_limit_is_valid() {
        let mut event = sample_event();
        event.service = "s".repeat(MAX_SERVICE_LEN);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_enrich_fills_missing_timestamp() {
        let mut event = sample_event();
        assert!(event.timestamp.is_none());

        let now = Utc::now();
        event.enrich("node-1", now);

        assert_eq!(event.timestamp, Some(now));
        assert_eq!(event.ingested_at, Some(now));
        assert_eq!(event.host.as_deref(), Some("node-1"));
    }

    #[test]
    fn test_enrich_preserves_caller_timestamp() {
        let caller_ts = "2026-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut event = sample_event();
        event.timestamp = Some(caller_ts);

        event.enrich("node-1", Utc::now());
        assert_eq!(event.timestamp, Some(caller_ts));
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let mut event = sample_event();
        event.trace_id = Some("trace-abc".to_string());
        event.enrich("node-1", Utc::now());

        let bytes = encode(&event).unwrap();
        let decoded = parse(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_partition_key_is_service_bytes() {
        let event = sample_event();
        assert_eq!(event.partition_key(), b"api");
    }

    #[test]
    fn test_metadata_accessors() {
        let event = sample_event();
        assert_eq!(event.latency_ms(), Some(42.5));
        assert_eq!(event.endpoint(), Some("/users"));

        let mut event = sample_event();
        event.metadata = None;
        assert_eq!(event.latency_ms(), None);
        assert_eq!(event.endpoint(), None);
    }

    #[test]
    fn test_level_round_trip() {
        for level in Level::ALL {
            assert_eq!(Level::from_str(level.as_str()), Ok(level));
        }
        assert!(Level::from_str("info").is_err());
        assert!(Level::Critical.is_error());
        assert!(Level::Error.is_error());
        assert!(!Level::Warn.is_error());
    }
}
