use crate::averaging::{FlushReport, WindowAccumulator};
use crate::telemetry::parse_reading;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue full; this (newest) message was discarded.
    Dropped,
    /// The worker is shutting down and no longer accepts messages.
    Closed,
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<QueuedMessage>,
    stats: Arc<IngestStats>,
}

pub fn channel(
    capacity: usize,
    stats: Arc<IngestStats>,
) -> (PipelineHandle, mpsc::Receiver<QueuedMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PipelineHandle { tx, stats }, rx)
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    /// Hands a raw payload to the ingest worker without waiting.
    pub fn try_enqueue(
        &self,
        topic: &str,
        payload: Bytes,
        received_at: DateTime<Utc>,
    ) -> EnqueueOutcome {
        let message = QueuedMessage {
            topic: topic.to_string(),
            payload,
            received_at,
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.enqueued_total.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(topic, queue_depth = self.depth(), "queued reading");
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(message)) => {
                let dropped = self.stats.dropped_total.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    topic = %message.topic,
                    capacity = self.capacity(),
                    dropped,
                    "ingest queue full; dropping message"
                );
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(message)) => {
                self.stats
                    .rejected_closed_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %message.topic, "ingest queue closed; rejecting message");
                EnqueueOutcome::Closed
            }
        }
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub enqueued_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub rejected_closed_total: AtomicU64,
    pub processed_total: AtomicU64,
    pub parse_errors_total: AtomicU64,
    pub persisted_total: AtomicU64,
    pub persist_failures_total: AtomicU64,
    pub empty_windows_total: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_flush_windows: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            enqueued_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            rejected_closed_total: AtomicU64::new(0),
            processed_total: AtomicU64::new(0),
            parse_errors_total: AtomicU64::new(0),
            persisted_total: AtomicU64::new(0),
            persist_failures_total: AtomicU64::new(0),
            empty_windows_total: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_flush_windows: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn record_persisted(&self) {
        self.persisted_total.fetch_add(1, Ordering::Relaxed);
        self.clear_error();
    }

    pub fn record_persist_failure(&self, err: impl Into<String>) {
        self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_flush(&self, report: &FlushReport) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        self.last_flush_windows
            .store(report.windows as u64, Ordering::Relaxed);
        self.empty_windows_total
            .fetch_add(report.empty_windows as u64, Ordering::Relaxed);
    }
}

/// Single consumer for the ingest queue. On cancellation the queue is closed,
/// whatever is already buffered is folded in, and the task exits.
pub fn spawn_worker(
    mut rx: mpsc::Receiver<QueuedMessage>,
    accumulator: Arc<WindowAccumulator>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut closing = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !closing => {
                    rx.close();
                    closing = true;
                    tracing::info!(remaining = rx.len(), "ingest queue closed; draining");
                }
                message = rx.recv() => {
                    match message {
                        Some(message) => process(message, &accumulator, &stats),
                        None => break,
                    }
                }
            }
        }

        tracing::info!(
            processed = stats.processed_total.load(Ordering::Relaxed),
            "ingest worker stopped"
        );
    })
}

fn process(message: QueuedMessage, accumulator: &WindowAccumulator, stats: &IngestStats) {
    let mut payload = message.payload.to_vec();
    match parse_reading(&mut payload) {
        Ok(reading) => {
            if reading.values.is_empty() {
                tracing::debug!(
                    key = %reading.key,
                    topic = %message.topic,
                    "reading carried no channel values"
                );
            }
            accumulator.add_reading(&reading);
            stats.processed_total.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                key = %reading.key,
                device_ts = ?reading.timestamp,
                received_at = %message.received_at,
                "folded reading into window"
            );
        }
        Err(err) => {
            stats.parse_errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                error = %err,
                topic = %message.topic,
                payload = %String::from_utf8_lossy(&message.payload),
                "discarding unparseable reading"
            );
        }
    }
}
