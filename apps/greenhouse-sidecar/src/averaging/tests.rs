use super::*;
use super::aggregator::{compute, compute_at};
use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::pipeline::IngestStats;
use crate::sink::{memory::MemorySink, AverageSink};
use crate::telemetry::{ChannelValues, NodeKey, Reading, SensorChannel};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn reading(greenhouse: &str, node: &str, values: &[(SensorChannel, f64)]) -> Reading {
    let values = values
        .iter()
        .fold(ChannelValues::default(), |acc, (channel, value)| {
            acc.with(*channel, *value)
        });
    Reading::new(NodeKey::new(greenhouse, node), values)
}

struct Harness {
    accumulator: Arc<WindowAccumulator>,
    sink: Arc<MemorySink>,
    stats: Arc<IngestStats>,
    aggregator: Arc<WindowAggregator>,
}

fn harness(breaker: BreakerConfig) -> Harness {
    let accumulator = Arc::new(WindowAccumulator::new());
    let sink = Arc::new(MemorySink::new());
    let stats = Arc::new(IngestStats::new());
    let dyn_sink: Arc<dyn AverageSink> = sink.clone();
    let aggregator = Arc::new(WindowAggregator::new(
        accumulator.clone(),
        Arc::new(CircuitBreaker::new(breaker)),
        Some(dyn_sink),
        stats.clone(),
    ));
    Harness {
        accumulator,
        sink,
        stats,
        aggregator,
    }
}

#[test]
fn drain_hands_every_reading_to_exactly_one_window() {
    let accumulator = WindowAccumulator::new();
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 1.0)]));
    accumulator.add_reading(&reading("GH1", "Node02", &[(SensorChannel::S1, 2.0)]));
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 3.0)]));

    let first = accumulator.drain_all();
    assert_eq!(first.len(), 2);
    assert_eq!(accumulator.count_pending(), 0);
    assert!(accumulator.drain_all().is_empty());

    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 4.0)]));
    let second = accumulator.drain_all();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].values(SensorChannel::S1), &[4.0]);

    let node01 = first
        .iter()
        .find(|b| b.key() == &NodeKey::new("GH1", "Node01"))
        .expect("Node01 window");
    assert_eq!(node01.values(SensorChannel::S1), &[1.0, 3.0]);
}

#[test]
fn drains_racing_adds_see_every_value_exactly_once() {
    const READINGS: usize = 20_000;
    let accumulator = WindowAccumulator::new();
    let adding = std::sync::atomic::AtomicBool::new(true);

    let mut seen: Vec<usize> = std::thread::scope(|scope| {
        let drainer = scope.spawn(|| {
            let mut seen = Vec::new();
            let mut drains = 0usize;
            while adding.load(Ordering::SeqCst) || drains == 0 {
                for buffer in accumulator.drain_all() {
                    seen.extend(buffer.values(SensorChannel::S1).iter().map(|v| *v as usize));
                }
                drains += 1;
                std::thread::yield_now();
            }
            seen
        });

        for i in 0..READINGS {
            accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, i as f64)]));
        }
        adding.store(false, Ordering::SeqCst);
        drainer.join().expect("drain thread")
    });

    for buffer in accumulator.drain_all() {
        seen.extend(buffer.values(SensorChannel::S1).iter().map(|v| *v as usize));
    }
    assert_eq!(accumulator.count_pending(), 0);

    seen.sort_unstable();
    assert_eq!(seen, (0..READINGS).collect::<Vec<_>>());
}

#[test]
fn same_node_in_different_greenhouses_is_separate() {
    let accumulator = WindowAccumulator::new();
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 1.0)]));
    accumulator.add_reading(&reading("GH2", "Node01", &[(SensorChannel::S1, 9.0)]));
    assert_eq!(accumulator.key_count(), 2);
    assert_eq!(accumulator.count_pending(), 2);
}

#[test]
fn averages_each_channel_independently() {
    let accumulator = WindowAccumulator::new();
    for value in [2.0, 4.0, 6.0] {
        accumulator.add_reading(&reading(
            "GH1",
            "Node01",
            &[(SensorChannel::S1, value), (SensorChannel::S5, value * 100.0)],
        ));
    }

    let buffers = accumulator.drain_all();
    let result = compute(&buffers[0]);
    assert_eq!(result.average(SensorChannel::S1), Some(4.0));
    assert_eq!(result.average(SensorChannel::S5), Some(400.0));
    assert_eq!(result.average(SensorChannel::S7), None);
    assert_eq!(result.reading_count, 3);
}

#[test]
fn zero_reading_is_a_value_not_an_absence() {
    let accumulator = WindowAccumulator::new();
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S3, 0.0)]));

    let result = compute(&accumulator.drain_all()[0]);
    assert_eq!(result.average(SensorChannel::S3), Some(0.0));
    assert_eq!(result.average(SensorChannel::S4), None);
}

#[test]
fn reading_count_follows_first_reported_channel() {
    let accumulator = WindowAccumulator::new();
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S2, 10.0)]));
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S2, 20.0)]));
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S9, 5.0)]));

    let result = compute(&accumulator.drain_all()[0]);
    assert_eq!(result.average(SensorChannel::S2), Some(15.0));
    assert_eq!(result.average(SensorChannel::S9), Some(5.0));
    assert_eq!(result.reading_count, 2);
}

#[tokio::test(start_paused = true)]
async fn compute_at_measures_duration_from_first_reading() {
    let accumulator = WindowAccumulator::new();
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 1.0)]));
    tokio::time::advance(Duration::from_secs(42)).await;
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 3.0)]));

    let buffers = accumulator.drain_all();
    let closed_at = buffers[0].started_at() + Duration::from_secs(60);
    let end = buffers[0].window_start() + chrono::Duration::seconds(60);
    let result = compute_at(&buffers[0], closed_at, end);
    assert_eq!(result.duration_seconds, 60.0);
    assert_eq!(result.window_end, end);
    assert_eq!(result.average(SensorChannel::S1), Some(2.0));
}

#[test]
fn concurrent_adds_for_many_nodes_are_all_counted() {
    let accumulator = WindowAccumulator::new();
    std::thread::scope(|scope| {
        for worker in 0..4 {
            let accumulator = &accumulator;
            scope.spawn(move || {
                let node = format!("Node{worker:02}");
                for i in 0..250 {
                    let value = [(SensorChannel::S1, i as f64)];
                    accumulator.add_reading(&reading("GH1", &node, &value));
                    accumulator.add_reading(&reading("GH1", "Shared", &[(SensorChannel::S2, 1.0)]));
                }
            });
        }
    });

    assert_eq!(accumulator.key_count(), 5);
    assert_eq!(accumulator.count_pending(), 2000);
    for buffer in accumulator.drain_all() {
        if buffer.key().node_id == "Shared" {
            assert_eq!(buffer.values(SensorChannel::S2).len(), 1000);
            assert!(buffer.values(SensorChannel::S1).is_empty());
        } else {
            assert_eq!(buffer.values(SensorChannel::S1).len(), 250);
        }
    }
}

#[tokio::test]
async fn empty_tick_reports_idle_and_skips_sink() {
    let h = harness(BreakerConfig::default());

    let report = h.aggregator.run_flush().await;
    assert!(report.is_idle());
    assert_eq!(report, FlushReport::default());
    assert_eq!(h.sink.attempts(), 0);
    assert!(h.stats.last_flush_unix_ms.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn flush_persists_each_window_and_publishes_results() {
    let h = harness(BreakerConfig::default());
    h.accumulator
        .add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 20.0)]));
    h.accumulator
        .add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 22.0)]));
    h.accumulator
        .add_reading(&reading("GH2", "Node07", &[(SensorChannel::S10, 6.5)]));

    let report = h.aggregator.run_flush().await;
    assert_eq!(report.windows, 2);
    assert_eq!(report.persisted, 2);
    assert_eq!(h.stats.persisted_total.load(Ordering::Relaxed), 2);
    assert_eq!(h.stats.last_flush_windows.load(Ordering::Relaxed), 2);
    assert_eq!(h.aggregator.pending_reading_count(), 0);

    let rows = h.sink.rows();
    assert_eq!(rows.len(), 2);

    let all = h.aggregator.current_results(&ResultFilter::default());
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].key, NodeKey::new("GH1", "Node01"));
    assert_eq!(all[0].average(SensorChannel::S1), Some(21.0));

    let gh2 = h
        .aggregator
        .current_results(&ResultFilter::new(Some("GH2"), None));
    assert_eq!(gh2.len(), 1);
    assert_eq!(gh2[0].average(SensorChannel::S10), Some(6.5));
}

#[tokio::test]
async fn later_window_replaces_earlier_result_for_same_node() {
    let h = harness(BreakerConfig::default());
    h.accumulator
        .add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 10.0)]));
    h.accumulator
        .add_reading(&reading("GH1", "Node02", &[(SensorChannel::S1, 99.0)]));
    h.aggregator.run_flush().await;

    h.accumulator
        .add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 30.0)]));
    h.aggregator.run_flush().await;

    let node01 = h
        .aggregator
        .current_results(&ResultFilter::new(Some(" GH1 "), Some("Node01")));
    assert_eq!(node01.len(), 1);
    assert_eq!(node01[0].average(SensorChannel::S1), Some(30.0));

    // Node02 was silent this window; its last result is still served.
    let node02 = h
        .aggregator
        .current_results(&ResultFilter::new(None, Some("Node02")));
    assert_eq!(node02[0].average(SensorChannel::S1), Some(99.0));
}

#[tokio::test]
async fn window_without_channel_values_is_not_persisted() {
    let h = harness(BreakerConfig::default());
    h.accumulator.add_reading(&reading("GH1", "Node01", &[]));

    let report = h.aggregator.run_flush().await;
    assert_eq!(report.windows, 1);
    assert_eq!(report.empty_windows, 1);
    assert_eq!(report.persisted, 0);
    assert_eq!(h.sink.attempts(), 0);
    assert_eq!(h.stats.empty_windows_total.load(Ordering::Relaxed), 1);

    let results = h.aggregator.current_results(&ResultFilter::default());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reading_count, 0);
}

#[tokio::test]
async fn open_breaker_skips_remaining_windows_without_aborting_flush() {
    let h = harness(BreakerConfig {
        failure_threshold: 1,
        ..BreakerConfig::default()
    });
    h.sink.set_failing(true);
    for node in ["Node01", "Node02", "Node03"] {
        h.accumulator
            .add_reading(&reading("GH1", node, &[(SensorChannel::S1, 1.0)]));
    }

    let report = h.aggregator.run_flush().await;
    assert_eq!(report.windows, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.rejected, 2);
    assert_eq!(h.sink.attempts(), 1);
    assert_eq!(h.aggregator.gate().snapshot().state, CircuitState::Open);
    assert_eq!(h.stats.persist_failures_total.load(Ordering::Relaxed), 1);
    assert!(h.stats.last_error().is_some());

    // Results are still computed and served while persistence is paused.
    assert_eq!(
        h.aggregator
            .current_results(&ResultFilter::default())
            .len(),
        3
    );
}

#[tokio::test]
async fn flush_without_sink_still_computes_results() {
    let accumulator = Arc::new(WindowAccumulator::new());
    let aggregator = WindowAggregator::new(
        accumulator.clone(),
        Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        None,
        Arc::new(IngestStats::new()),
    );
    accumulator.add_reading(&reading("GH1", "Node01", &[(SensorChannel::S6, 3.5)]));

    let report = aggregator.run_flush().await;
    assert_eq!(report.windows, 1);
    assert_eq!(report.skipped_no_sink, 1);
    assert!(aggregator.sink().is_none());
    assert_eq!(
        aggregator.current_results(&ResultFilter::default())[0].average(SensorChannel::S6),
        Some(3.5)
    );
}

#[tokio::test(start_paused = true)]
async fn flush_loop_closes_window_every_period_until_cancelled() {
    let h = harness(BreakerConfig::default());
    h.accumulator
        .add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 5.0)]));

    let cancel = CancellationToken::new();
    let handle = spawn_flush_loop(h.aggregator.clone(), Duration::from_secs(60), cancel.clone());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.sink.rows().is_empty());
    assert_eq!(h.aggregator.pending_reading_count(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let rows = h.sink.rows();
    assert_eq!(rows.len(), 1);
    assert!((rows[0].duration_seconds - 60.0).abs() < 1e-6);
    assert_eq!(h.aggregator.pending_reading_count(), 0);

    cancel.cancel();
    handle.await.expect("flush loop exits");

    h.accumulator
        .add_reading(&reading("GH1", "Node01", &[(SensorChannel::S1, 7.0)]));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.sink.rows().len(), 1);
    assert_eq!(h.aggregator.pending_reading_count(), 1);
}
