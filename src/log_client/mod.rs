//! Log Client Adapter
//!
//! Producer and consumer-group abstraction over the partitioned event log.
//! The rest of the pipeline relies only on the log's contract: same key →
//! same partition, per-partition ordering, monotonic offsets, and explicit
//! commits that happen after the downstream effect is durable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::common::config::HeliosConfig;
use crate::error::PipelineError;

/// Producer-side linger; short so single-event latency stays bounded while
/// bursts still coalesce into one wire batch.
const PRODUCER_LINGER_MS: u64 = 10;

/// Bounded produce retries before the failure is surfaced to the caller.
const PRODUCE_ATTEMPTS: u32 = 3;
const PRODUCE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Per-send broker acknowledgement deadline.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for metadata probes in readiness checks.
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker acknowledgement for one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Seam between the pipeline and the log producer, so HTTP handlers and the
/// detector can be exercised without a broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one message. Resolves once the broker has acknowledged it at
    /// the configured acks level, or after bounded retries have failed.
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Ack, PipelineError>;

    /// Whether the log currently answers metadata requests for `topic`.
    async fn is_reachable(&self, topic: &str) -> bool;
}

/// Kafka producer wrapper shared by the ingestion service and the detector.
pub struct LogProducer {
    producer: FutureProducer,
}

impl LogProducer {
    pub fn new(config: &HeliosConfig, client_id: &str) -> Result<Self, PipelineError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.log_brokers)
            .set("client.id", client_id)
            .set("message.timeout.ms", "5000")
            .set("compression.type", "lz4")
            .set("batch.num.messages", config.batch_size.to_string())
            .set("linger.ms", PRODUCER_LINGER_MS.to_string())
            .set("acks", &config.log_acks)
            .create()
            .map_err(|e| PipelineError::PermanentIo(format!("failed to create producer: {e}")))?;

        info!(
            brokers = %config.log_brokers,
            acks = %config.log_acks,
            "Log producer initialized"
        );

        Ok(Self { producer })
    }

    /// Drain the send queue; called during graceful shutdown after the last
    /// request has been answered.
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(timeout) {
            warn!("Producer flush incomplete: {e}");
        }
    }
}

#[async_trait]
impl EventPublisher for LogProducer {
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Ack, PipelineError> {
        let timestamp_ms = timestamp.timestamp_millis();
        let mut last_err = String::new();

        for attempt in 0..PRODUCE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(PRODUCE_RETRY_BACKOFF * attempt).await;
            }

            let record = FutureRecord::to(topic)
                .key(key)
                .payload(payload)
                .timestamp(timestamp_ms);

            match self.producer.send(record, SEND_TIMEOUT).await {
                Ok((partition, offset)) => {
                    debug!(topic, partition, offset, "Message acknowledged");
                    return Ok(Ack { partition, offset });
                }
                Err((e, _)) => {
                    warn!(topic, attempt, "Produce attempt failed: {e}");
                    last_err = e.to_string();
                }
            }
        }

        Err(PipelineError::TransientIo(format!(
            "produce to {topic} failed after {PRODUCE_ATTEMPTS} attempts: {last_err}"
        )))
    }

    async fn is_reachable(&self, topic: &str) -> bool {
        let producer = self.producer.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

/// One message pulled from the log, detached from the underlying fetch
/// buffer so it can cross task boundaries.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Kafka consumer-group wrapper with explicit offset commits.
///
/// Auto-commit stays off: callers commit only after their downstream effect
/// (a store transaction, a folded window) is in place, which is what keeps
/// delivery at-least-once across restarts.
pub struct LogConsumer {
    consumer: Arc<StreamConsumer>,
}

impl LogConsumer {
    pub fn new(
        config: &HeliosConfig,
        group: &str,
        topics: &[&str],
        client_id: &str,
    ) -> Result<Self, PipelineError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group)
            .set("bootstrap.servers", &config.log_brokers)
            .set("client.id", client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("heartbeat.interval.ms", "2000")
            .create()
            .map_err(|e| PipelineError::PermanentIo(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(topics)
            .map_err(|e| PipelineError::PermanentIo(format!("failed to subscribe: {e}")))?;

        info!(group, ?topics, "Consumer subscribed");

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    /// Fetch the next message. Back-pressure is simply not calling this
    /// until the previous message has been handed off.
    pub async fn recv(&self) -> Result<ConsumedRecord, PipelineError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| PipelineError::TransientIo(format!("consumer fetch failed: {e}")))?;

        Ok(ConsumedRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    /// Commit the offset watermark for one consumed record.
    pub fn commit_record(&self, record: &ConsumedRecord) -> Result<(), PipelineError> {
        self.commit_offsets(&record.topic, &[(record.partition, record.offset)])
    }

    /// Commit explicit `(partition, last consumed offset)` watermarks. The
    /// committed position is `offset + 1`, the next offset to read.
    pub fn commit_offsets(
        &self,
        topic: &str,
        offsets: &[(i32, i64)],
    ) -> Result<(), PipelineError> {
        let mut list = TopicPartitionList::new();
        for &(partition, offset) in offsets {
            list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| PipelineError::TransientIo(format!("bad offset list: {e}")))?;
        }

        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| PipelineError::TransientIo(format!("offset commit failed: {e}")))
    }

    /// Metadata probe used for the startup reachability gate.
    pub async fn is_reachable(&self, topic: &str) -> bool {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            consumer
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}
