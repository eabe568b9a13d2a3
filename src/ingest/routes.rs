//! HTTP handlers for the ingestion surface.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::ValidationError;
use crate::schemas::events::{encode, parse, LogEvent};

use super::AppState;

/// Batch size bounds, inclusive.
pub const MAX_BATCH_EVENTS: usize = 1000;

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct BatchAcceptedResponse {
    pub status: &'static str,
    pub total: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub log: bool,
}

/// Handler-level failures mapped onto the response contract: validation is
/// a 400 naming the first failing constraint, log unavailability is an
/// opaque 503, serialization trouble is a 500.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Unavailable,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                "validation failed",
                Some(err.to_string()),
            ),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "event log unavailable", None),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error", None),
        };

        let body = json!({
            "status": "error",
            "error": error,
            "details": details,
        });

        (status, Json(body)).into_response()
    }
}

fn service_label(event: &LogEvent) -> &str {
    if event.service.is_empty() {
        "unknown"
    } else {
        &event.service
    }
}

fn level_label(event: &LogEvent) -> &str {
    if event.level.is_empty() {
        "unknown"
    } else {
        &event.level
    }
}

/// `POST /api/v1/events` — accept one event.
pub async fn ingest_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let timer = state
        .metrics
        .ingestion_latency
        .with_label_values(&["events"])
        .start_timer();

    let result = handle_single(&state, &body).await;
    timer.observe_duration();
    result
}

async fn handle_single(
    state: &AppState,
    body: &[u8],
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let mut event = match parse(body) {
        Ok(event) => event,
        Err(err) => {
            state.metrics.observe_rejected("unknown", "unknown");
            return Err(ApiError::Validation(err));
        }
    };

    if let Err(err) = event.validate() {
        state
            .metrics
            .observe_rejected(service_label(&event), level_label(&event));
        debug!(service = %event.service, "Rejected event: {err}");
        return Err(ApiError::Validation(err));
    }

    let now = Utc::now();
    event.enrich(&state.host, now);

    let payload = encode(&event).map_err(|e| {
        error!("Failed to serialize enriched event: {e}");
        ApiError::Internal
    })?;

    let timestamp = event.timestamp.unwrap_or(now);
    match state
        .publisher
        .publish(&state.events_topic, event.partition_key(), &payload, timestamp)
        .await
    {
        Ok(_) => {
            state
                .metrics
                .observe_accepted(&event.service, &event.level);
            Ok((
                StatusCode::ACCEPTED,
                Json(AcceptedResponse {
                    status: "accepted",
                    timestamp: now,
                    message: "event accepted",
                }),
            ))
        }
        Err(err) => {
            state.metrics.producer_errors.inc();
            state
                .metrics
                .observe_failed(&event.service, &event.level);
            warn!(service = %event.service, "Publish failed: {err}");
            Err(ApiError::Unavailable)
        }
    }
}

/// `POST /api/v1/events/batch` — accept up to 1000 events in one request.
///
/// Invalid events are skipped and counted; the valid remainder goes to the
/// log as a single produce batch. Any broker-side failure fails the whole
/// request and nothing is counted accepted.
pub async fn ingest_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchAcceptedResponse>), ApiError> {
    let timer = state
        .metrics
        .ingestion_latency
        .with_label_values(&["events_batch"])
        .start_timer();

    let result = handle_batch(&state, &body).await;
    timer.observe_duration();
    result
}

async fn handle_batch(
    state: &AppState,
    body: &[u8],
) -> Result<(StatusCode, Json<BatchAcceptedResponse>), ApiError> {
    let request: BatchRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(ValidationError::MalformedJson(e.to_string())))?;

    let total = request.events.len();
    if total == 0 || total > MAX_BATCH_EVENTS {
        return Err(ApiError::Validation(ValidationError::BatchSizeOutOfRange(
            total,
        )));
    }

    let now = Utc::now();
    let mut prepared = Vec::with_capacity(total);
    let mut error_count = 0usize;

    for value in request.events {
        let mut event: LogEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(err) => {
                debug!("Skipping undecodable batch entry: {err}");
                state.metrics.observe_rejected("unknown", "unknown");
                error_count += 1;
                continue;
            }
        };

        if let Err(err) = event.validate() {
            debug!(service = %event.service, "Skipping invalid batch entry: {err}");
            state
                .metrics
                .observe_rejected(service_label(&event), level_label(&event));
            error_count += 1;
            continue;
        }

        event.enrich(&state.host, now);
        let payload = match encode(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to serialize batch entry: {err}");
                error_count += 1;
                continue;
            }
        };

        let timestamp = event.timestamp.unwrap_or(now);
        prepared.push((event, payload, timestamp));
    }

    // One produce batch: every message is handed to the producer before any
    // ack is awaited, so the broker sees them as one linger window.
    let sends = prepared.iter().map(|(event, payload, timestamp)| {
        state.publisher.publish(
            &state.events_topic,
            event.partition_key(),
            payload,
            *timestamp,
        )
    });
    let results = futures::future::join_all(sends).await;

    if let Some(err) = results.iter().find_map(|r| r.as_ref().err()) {
        state.metrics.producer_errors.inc();
        warn!("Batch publish failed, rejecting whole batch: {err}");
        return Err(ApiError::Unavailable);
    }

    for (event, _, _) in &prepared {
        state
            .metrics
            .observe_accepted(&event.service, &event.level);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchAcceptedResponse {
            status: "accepted",
            total,
            success_count: prepared.len(),
            error_count,
            timestamp: now,
        }),
    ))
}

/// `GET /health` — liveness; 200 once the process serves traffic.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /ready` — readiness; 200 iff the event log answers metadata.
pub async fn ready(State(state): State<AppState>) -> Response {
    let log_ready = state.publisher.is_reachable(&state.events_topic).await;

    let body = Json(ReadinessResponse {
        ready: log_ready,
        checks: ReadinessChecks { log: log_ready },
    });

    if log_ready {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}
