use super::accumulator::{WindowAccumulator, WindowBuffer};
use crate::breaker::{CircuitBreaker, GateError};
use crate::pipeline::IngestStats;
use crate::sink::AverageSink;
use crate::telemetry::{ChannelValues, NodeKey, SensorChannel};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateResult {
    pub key: NodeKey,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub duration_seconds: f64,
    pub reading_count: u64,
    /// Mean per channel; channels without readings stay `None`.
    pub averages: ChannelValues,
}

impl AggregateResult {
    pub fn average(&self, channel: SensorChannel) -> Option<f64> {
        self.averages.get(channel)
    }
}

struct AveragesDisplay<'a>(&'a ChannelValues);

impl fmt::Display for AveragesDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (channel, value) in self.0.present() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}({})={:.2}", channel, channel.label(), value)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

pub fn compute(buffer: &WindowBuffer) -> AggregateResult {
    compute_at(buffer, Instant::now(), Utc::now())
}

pub fn compute_at(
    buffer: &WindowBuffer,
    closed_at: Instant,
    window_end: DateTime<Utc>,
) -> AggregateResult {
    let mut averages = ChannelValues::default();
    for channel in SensorChannel::ALL {
        let values = buffer.values(channel);
        if values.is_empty() {
            continue;
        }
        let sum: f64 = values.iter().sum();
        averages.set(channel, Some(sum / values.len() as f64));
    }

    AggregateResult {
        key: buffer.key().clone(),
        window_start: buffer.window_start(),
        window_end,
        duration_seconds: closed_at
            .saturating_duration_since(buffer.started_at())
            .as_secs_f64(),
        reading_count: buffer.reading_count() as u64,
        averages,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultFilter {
    pub greenhouse_id: Option<String>,
    pub node_id: Option<String>,
}

impl ResultFilter {
    pub fn new(greenhouse_id: Option<&str>, node_id: Option<&str>) -> Self {
        let clean = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };
        Self {
            greenhouse_id: clean(greenhouse_id),
            node_id: clean(node_id),
        }
    }

    pub fn matches(&self, key: &NodeKey) -> bool {
        self.greenhouse_id
            .as_deref()
            .map_or(true, |gh| gh == key.greenhouse_id)
            && self.node_id.as_deref().map_or(true, |node| node == key.node_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub windows: usize,
    pub persisted: usize,
    pub empty_windows: usize,
    pub rejected: usize,
    pub failed: usize,
    pub skipped_no_sink: usize,
}

impl FlushReport {
    /// Nothing was drained: no node reported during the window.
    pub fn is_idle(&self) -> bool {
        self.windows == 0
    }
}

pub struct WindowAggregator {
    accumulator: Arc<WindowAccumulator>,
    gate: Arc<CircuitBreaker>,
    sink: Option<Arc<dyn AverageSink>>,
    latest: RwLock<HashMap<NodeKey, AggregateResult>>,
    stats: Arc<IngestStats>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl WindowAggregator {
    pub fn new(
        accumulator: Arc<WindowAccumulator>,
        gate: Arc<CircuitBreaker>,
        sink: Option<Arc<dyn AverageSink>>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            accumulator,
            gate,
            sink,
            latest: RwLock::new(HashMap::new()),
            stats,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn gate(&self) -> &Arc<CircuitBreaker> {
        &self.gate
    }

    pub fn sink(&self) -> Option<&Arc<dyn AverageSink>> {
        self.sink.as_ref()
    }

    pub fn pending_reading_count(&self) -> usize {
        self.accumulator.count_pending()
    }

    pub fn pending_key_count(&self) -> usize {
        self.accumulator.key_count()
    }

    /// Results of the last completed window for every matching node, sorted
    /// by key. Never looks at the live accumulator.
    pub fn current_results(&self, filter: &ResultFilter) -> Vec<AggregateResult> {
        let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
        let mut results: Vec<AggregateResult> = latest
            .values()
            .filter(|result| filter.matches(&result.key))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.key.cmp(&b.key));
        results
    }

    /// Returns once no flush is running.
    pub async fn wait_idle(&self) {
        let _flushing = self.flush_lock.lock().await;
    }

    pub async fn run_flush(&self) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        let drained = self.accumulator.drain_all();
        if drained.is_empty() {
            tracing::info!("no sensor readings received this window; nothing to flush");
            self.stats.record_flush(&report);
            return report;
        }

        let results: Vec<AggregateResult> = drained.iter().map(compute).collect();

        {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            for result in &results {
                latest.insert(result.key.clone(), result.clone());
            }
        }

        for result in &results {
            report.windows += 1;
            tracing::info!(
                greenhouse = %result.key.greenhouse_id,
                node = %result.key.node_id,
                readings = result.reading_count,
                duration_s = result.duration_seconds,
                averages = %AveragesDisplay(&result.averages),
                "window averages"
            );

            if result.reading_count == 0 {
                report.empty_windows += 1;
                tracing::warn!(
                    greenhouse = %result.key.greenhouse_id,
                    node = %result.key.node_id,
                    "window has no channel values; not persisting"
                );
                continue;
            }

            self.persist(result, &mut report).await;
        }

        self.stats.record_flush(&report);
        report
    }

    async fn persist(&self, result: &AggregateResult, report: &mut FlushReport) {
        let Some(sink) = self.sink.as_ref() else {
            report.skipped_no_sink += 1;
            return;
        };

        match self.gate.call(|| sink.write(result)).await {
            Ok(()) => {
                report.persisted += 1;
                self.stats.record_persisted();
                tracing::debug!(
                    key = %result.key,
                    readings = result.reading_count,
                    "persisted window averages"
                );
            }
            Err(GateError::Open) => {
                report.rejected += 1;
                tracing::warn!(
                    key = %result.key,
                    "circuit breaker open; skipping persistence this window"
                );
            }
            Err(err) => {
                report.failed += 1;
                self.stats.record_persist_failure(err.to_string());
                tracing::warn!(
                    error = %err,
                    key = %result.key,
                    "failed to persist window averages"
                );
            }
        }
    }
}

/// Runs `run_flush` every `period`, first firing one period after start.
/// Cancelling stops new flushes; a flush already running finishes.
pub fn spawn_flush_loop(
    aggregator: Arc<WindowAggregator>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = aggregator.run_flush().await;
                    if !report.is_idle() {
                        tracing::debug!(?report, "window flush complete");
                    }
                }
            }
        }

        tracing::info!("flush loop stopped");
    })
}
