//! Storage Writer
//!
//! First consumer of the events topic: fetcher task → bounded channel →
//! batch writer. A batch flushes when it hits the target size or when the
//! flush timer fires; the flush runs one transaction and only then commits
//! the source log offsets, so a crash between the two replays the batch
//! instead of losing it.

use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::common::config::HeliosConfig;
use crate::database::Database;
use crate::error::PipelineError;
use crate::log_client::LogConsumer;
use crate::schemas::events::{parse, LogEvent};

/// How long the fetcher waits on a full channel before shedding, when
/// shedding is enabled. The default policy blocks instead.
const SHED_TIMEOUT: Duration = Duration::from_secs(5);

/// Transient flush retries before the batch is parked for the next tick.
const FLUSH_ATTEMPTS: u32 = 3;
const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct StorageMetrics {
    pub rows_written: IntCounter,
    pub rows_rejected: IntCounter,
    pub batches_flushed: IntCounter,
    pub flush_failures: IntCounter,
    pub decode_errors: IntCounter,
    pub dropped: IntCounter,
    pub flush_duration: Histogram,
}

impl StorageMetrics {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            rows_written: register_int_counter!(
                "storage_writer_rows_written_total",
                "Event rows committed to the store"
            )?,
            rows_rejected: register_int_counter!(
                "storage_writer_rows_rejected_total",
                "Rows dropped after a store constraint rejected them"
            )?,
            batches_flushed: register_int_counter!(
                "storage_writer_batches_flushed_total",
                "Successful batch transactions"
            )?,
            flush_failures: register_int_counter!(
                "storage_writer_flush_failures_total",
                "Flush attempts that failed and will be retried"
            )?,
            decode_errors: register_int_counter!(
                "storage_writer_decode_errors_total",
                "Log records that failed to decode as events"
            )?,
            dropped: register_int_counter!(
                "storage_writer_dropped_total",
                "Events shed because the writer stayed backlogged"
            )?,
            flush_duration: register_histogram!(
                "storage_writer_flush_duration_seconds",
                "Wall time per batch flush"
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StorageWriterConfig {
    pub events_topic: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub channel_capacity: usize,
    pub shed_when_full: bool,
}

impl StorageWriterConfig {
    pub fn from_config(config: &HeliosConfig) -> Self {
        Self {
            events_topic: config.events_topic.clone(),
            batch_size: config.batch_size.max(1),
            flush_interval: config.batch_timeout(),
            channel_capacity: config.channel_capacity.max(1),
            shed_when_full: config.shed_when_full,
        }
    }
}

/// One decoded event still tied to its log position; the offset commits
/// only after the row is durable.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: LogEvent,
    pub partition: i32,
    pub offset: i64,
}

/// Highest consumed offset per partition, the commit watermarks for one
/// flushed batch.
pub fn max_offsets(batch: &[PendingEvent]) -> Vec<(i32, i64)> {
    let mut offsets: BTreeMap<i32, i64> = BTreeMap::new();
    for pending in batch {
        offsets
            .entry(pending.partition)
            .and_modify(|o| *o = (*o).max(pending.offset))
            .or_insert(pending.offset);
    }
    offsets.into_iter().collect()
}

pub struct StorageWriter {
    config: StorageWriterConfig,
    database: Arc<Database>,
    metrics: Arc<StorageMetrics>,
}

impl StorageWriter {
    pub fn new(
        config: StorageWriterConfig,
        database: Arc<Database>,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            config,
            database,
            metrics,
        }
    }

    /// Run fetcher and writer until shutdown. Returns an error only on a
    /// permanent store failure; everything transient is retried in place.
    pub async fn run(
        &self,
        consumer: Arc<LogConsumer>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        let fetcher = tokio::spawn(fetch_loop(
            Arc::clone(&consumer),
            tx,
            shutdown.clone(),
            Arc::clone(&self.metrics),
            self.config.shed_when_full,
        ));

        let result = self.write_loop(rx, &consumer, shutdown).await;

        fetcher.abort();
        let _ = fetcher.await;
        result
    }

    async fn write_loop(
        &self,
        mut rx: mpsc::Receiver<PendingEvent>,
        consumer: &LogConsumer,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let mut batch: Vec<PendingEvent> = Vec::with_capacity(self.config.batch_size);
        let mut flush_tick = tokio::time::interval(self.config.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Storage writer running"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Final flush: take whatever the fetcher already queued,
                    // write it, commit, exit clean.
                    while let Ok(pending) = rx.try_recv() {
                        batch.push(pending);
                    }
                    self.flush(&mut batch, consumer).await?;
                    info!("Storage writer stopping");
                    return Ok(());
                }
                _ = flush_tick.tick() => {
                    self.flush(&mut batch, consumer).await?;
                }
                received = rx.recv() => match received {
                    Some(pending) => {
                        batch.push(pending);
                        if batch.len() >= self.config.batch_size {
                            self.flush(&mut batch, consumer).await?;
                        }
                    }
                    None => {
                        self.flush(&mut batch, consumer).await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Write the batch in one transaction, then commit offsets. On
    /// transient failure the batch is kept and offsets stay put; on a
    /// constraint abort the batch replays row by row, skipping provably bad
    /// rows.
    async fn flush(
        &self,
        batch: &mut Vec<PendingEvent>,
        consumer: &LogConsumer,
    ) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let timer = self.metrics.flush_duration.start_timer();
        let events: Vec<LogEvent> = batch.iter().map(|p| p.event.clone()).collect();

        let mut attempt = 0u32;
        loop {
            match self.database.insert_events(&events).await {
                Ok(written) => {
                    self.metrics.rows_written.inc_by(written);
                    self.metrics.batches_flushed.inc();
                    break;
                }
                Err(PipelineError::Integrity(reason)) => {
                    warn!("Batch aborted by constraint, replaying row by row: {reason}");
                    match self.database.insert_events_skipping_bad(&events).await {
                        Ok((inserted, rejected)) => {
                            self.metrics.rows_written.inc_by(inserted);
                            self.metrics.rows_rejected.inc_by(rejected);
                            self.metrics.batches_flushed.inc();
                            break;
                        }
                        Err(err) if err.is_transient() => {
                            self.metrics.flush_failures.inc();
                            warn!("Row replay failed, keeping batch: {err}");
                            timer.observe_duration();
                            return Ok(());
                        }
                        Err(err) => {
                            timer.observe_duration();
                            return Err(err);
                        }
                    }
                }
                Err(err) if err.is_transient() && attempt + 1 < FLUSH_ATTEMPTS => {
                    attempt += 1;
                    self.metrics.flush_failures.inc();
                    warn!(attempt, "Flush failed, retrying: {err}");
                    tokio::time::sleep(FLUSH_RETRY_BACKOFF * attempt).await;
                }
                Err(err) if err.is_transient() => {
                    // Park the batch; offsets stay uncommitted so nothing is
                    // lost, and the next tick retries.
                    self.metrics.flush_failures.inc();
                    warn!("Flush failed after {FLUSH_ATTEMPTS} attempts, keeping batch: {err}");
                    timer.observe_duration();
                    return Ok(());
                }
                Err(err) => {
                    timer.observe_duration();
                    return Err(err);
                }
            }
        }

        let offsets = max_offsets(batch);
        if let Err(e) = consumer.commit_offsets(&self.config.events_topic, &offsets) {
            // Rows are durable; the worst case on restart is duplicate rows,
            // which at-least-once already admits.
            warn!("Offset commit failed after flush: {e}");
        }

        batch.clear();
        timer.observe_duration();
        Ok(())
    }
}

async fn fetch_loop(
    consumer: Arc<LogConsumer>,
    tx: mpsc::Sender<PendingEvent>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<StorageMetrics>,
    shed_when_full: bool,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            record = consumer.recv() => {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Consumer fetch failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let event = match parse(&record.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        // Provably bad: it can never become a row, so the
                        // offset advances past it.
                        metrics.decode_errors.inc();
                        warn!(offset = record.offset, "Skipping undecodable log record: {e}");
                        if let Err(e) = consumer.commit_record(&record) {
                            warn!("Offset commit failed: {e}");
                        }
                        continue;
                    }
                };

                let pending = PendingEvent {
                    event,
                    partition: record.partition,
                    offset: record.offset,
                };

                if shed_when_full {
                    match tx.send_timeout(pending, SHED_TIMEOUT).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            metrics.dropped.inc();
                            warn!("Writer backlogged past {SHED_TIMEOUT:?}, shedding event");
                            if let Err(e) = consumer.commit_record(&record) {
                                warn!("Offset commit failed: {e}");
                            }
                        }
                        Err(SendTimeoutError::Closed(_)) => break,
                    }
                } else if tx.send(pending).await.is_err() {
                    // Writer gone; nothing left to feed.
                    break;
                }
            }
        }
    }
}
