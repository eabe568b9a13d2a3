//! DDL for the time-series store.
//!
//! `events` is the hot table, partitioned by `time` into 1-day chunks.
//! `anomalies` mirrors the records published to the alerts topic for
//! operators who want them queryable next to the raw events.

pub const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        time        TIMESTAMPTZ NOT NULL,
        service     TEXT        NOT NULL,
        level       TEXT        NOT NULL
                    CHECK (level IN ('DEBUG', 'INFO', 'WARN', 'ERROR', 'CRITICAL')),
        message     TEXT        NOT NULL,
        metadata    JSONB,
        trace_id    TEXT,
        span_id     TEXT,
        host        TEXT,
        ingested_at TIMESTAMPTZ DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS anomalies (
        anomaly_id  UUID PRIMARY KEY,
        time        TIMESTAMPTZ NOT NULL,
        service     TEXT        NOT NULL,
        score       DOUBLE PRECISION NOT NULL,
        threshold   DOUBLE PRECISION NOT NULL,
        severity    TEXT        NOT NULL
                    CHECK (severity IN ('LOW', 'MEDIUM', 'HIGH', 'CRITICAL')),
        features    JSONB       NOT NULL,
        confidence  DOUBLE PRECISION,
        is_resolved BOOLEAN     NOT NULL DEFAULT FALSE
    )
    "#,
];

pub const HYPERTABLES: &[&str] = &[
    r#"
    SELECT create_hypertable('events', 'time',
        if_not_exists => TRUE,
        chunk_time_interval => INTERVAL '1 day'
    )
    "#,
];

pub const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_events_service_time ON events (service, time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_events_errors ON events (level, time DESC) \
     WHERE level IN ('ERROR', 'CRITICAL')",
    "CREATE INDEX IF NOT EXISTS idx_events_trace ON events (trace_id) \
     WHERE trace_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_events_metadata ON events USING GIN (metadata)",
    "CREATE INDEX IF NOT EXISTS idx_anomalies_service_time ON anomalies (service, time DESC)",
];
