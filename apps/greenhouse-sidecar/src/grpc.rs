use crate::averaging::{AggregateResult, FlushReport, ResultFilter, WindowAggregator};
use crate::breaker::CircuitSnapshot;
use crate::pipeline::PipelineHandle;
use crate::sink::clamp_history_limit;
use crate::telemetry::ChannelSelection;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("greenhouse.averages");
}

use proto::averages_server::{Averages, AveragesServer};
use proto::{
    BreakerHealth, Empty, FlushResponse, HealthResponse, HistoryRequest, PendingReadingCount,
    WindowAverage, WindowResults,
};

#[derive(Clone)]
pub struct AveragesService {
    aggregator: Arc<WindowAggregator>,
    pipeline: PipelineHandle,
}

impl AveragesService {
    pub fn new(aggregator: Arc<WindowAggregator>, pipeline: PipelineHandle) -> Self {
        Self {
            aggregator,
            pipeline,
        }
    }

    fn map_filter(filter: Option<proto::ResultFilter>) -> (ResultFilter, ChannelSelection) {
        match filter {
            Some(filter) => (
                ResultFilter::new(Some(&filter.greenhouse_id), Some(&filter.node_id)),
                ChannelSelection::parse(&filter.channels),
            ),
            None => (ResultFilter::default(), ChannelSelection::default()),
        }
    }

    fn map_result(result: AggregateResult, channels: &ChannelSelection) -> WindowAverage {
        WindowAverage {
            greenhouse_id: result.key.greenhouse_id,
            node_id: result.key.node_id,
            window_start_ms: result.window_start.timestamp_millis(),
            window_end_ms: result.window_end.timestamp_millis(),
            duration_seconds: result.duration_seconds,
            reading_count: result.reading_count,
            averages: result
                .averages
                .present()
                .filter(|(channel, _)| channels.includes(*channel))
                .map(|(channel, value)| (channel.wire_key().to_string(), value))
                .collect(),
        }
    }

    fn map_breaker(snapshot: CircuitSnapshot) -> BreakerHealth {
        BreakerHealth {
            state: snapshot.state.as_str().to_string(),
            consecutive_failures: snapshot.consecutive_failures,
            last_failure_unix_ms: snapshot
                .last_failure_at
                .map(|at| at.timestamp_millis())
                .unwrap_or(0),
            failure_threshold: snapshot.failure_threshold,
            open_timeout_ms: snapshot.open_timeout.as_millis() as u64,
        }
    }

    fn to_health(&self) -> HealthResponse {
        let stats = self.pipeline.stats();
        HealthResponse {
            breaker: Some(Self::map_breaker(self.aggregator.gate().snapshot())),
            persistence_enabled: self.aggregator.sink().is_some(),
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            queue_depth: self.pipeline.depth() as u64,
            queue_capacity: self.pipeline.capacity() as u64,
            enqueued_total: stats.enqueued_total.load(Ordering::Relaxed),
            dropped_total: stats.dropped_total.load(Ordering::Relaxed),
            rejected_closed_total: stats.rejected_closed_total.load(Ordering::Relaxed),
            processed_total: stats.processed_total.load(Ordering::Relaxed),
            parse_errors_total: stats.parse_errors_total.load(Ordering::Relaxed),
            persisted_total: stats.persisted_total.load(Ordering::Relaxed),
            persist_failures_total: stats.persist_failures_total.load(Ordering::Relaxed),
            empty_windows_total: stats.empty_windows_total.load(Ordering::Relaxed),
            last_flush_unix_ms: stats.last_flush_unix_ms.load(Ordering::Relaxed),
            last_flush_windows: stats.last_flush_windows.load(Ordering::Relaxed),
            pending_readings: self.aggregator.pending_reading_count() as u64,
            last_error: stats.last_error().unwrap_or_default(),
            build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl From<FlushReport> for FlushResponse {
    fn from(report: FlushReport) -> Self {
        Self {
            windows: report.windows as u64,
            persisted: report.persisted as u64,
            empty_windows: report.empty_windows as u64,
            rejected: report.rejected as u64,
            failed: report.failed as u64,
            skipped_no_sink: report.skipped_no_sink as u64,
        }
    }
}

#[tonic::async_trait]
impl Averages for AveragesService {
    async fn get_current_window_results(
        &self,
        request: Request<proto::ResultFilter>,
    ) -> Result<Response<WindowResults>, Status> {
        let (filter, channels) = Self::map_filter(Some(request.into_inner()));
        let results = self
            .aggregator
            .current_results(&filter)
            .into_iter()
            .map(|result| Self::map_result(result, &channels))
            .collect();
        Ok(Response::new(WindowResults { results }))
    }

    async fn get_pending_reading_count(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<PendingReadingCount>, Status> {
        Ok(Response::new(PendingReadingCount {
            pending: self.aggregator.pending_reading_count() as u64,
            keys: self.aggregator.pending_key_count() as u64,
        }))
    }

    async fn query_history(
        &self,
        request: Request<HistoryRequest>,
    ) -> Result<Response<WindowResults>, Status> {
        let payload = request.into_inner();
        let sink = self
            .aggregator
            .sink()
            .ok_or_else(|| Status::failed_precondition("persistence is disabled"))?;

        let (filter, channels) = Self::map_filter(payload.filter);
        let rows = sink
            .query(&filter, clamp_history_limit(payload.limit))
            .await
            .map_err(|err| Status::unavailable(format!("history query failed: {err:#}")))?;

        Ok(Response::new(WindowResults {
            results: rows
                .into_iter()
                .map(|row| Self::map_result(row, &channels))
                .collect(),
        }))
    }

    async fn get_health(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(self.to_health()))
    }

    async fn flush(&self, _request: Request<Empty>) -> Result<Response<FlushResponse>, Status> {
        // A cancelled call must not stop a flush that has already drained windows.
        let aggregator = self.aggregator.clone();
        let report = tokio::spawn(async move { aggregator.run_flush().await })
            .await
            .map_err(|err| Status::internal(format!("flush task failed: {err}")))?;
        tracing::info!(?report, "flush requested over gRPC");
        Ok(Response::new(report.into()))
    }
}

/// Binds the control-plane socket, replacing a stale socket file.
pub async fn bind_uds(socket_path: &str) -> Result<UnixListener> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }
    let uds = UnixListener::bind(socket_path)
        .with_context(|| format!("binding gRPC socket {socket_path}"))?;
    tracing::info!(socket = %socket_path, "gRPC control plane listening");
    Ok(uds)
}

pub async fn serve_uds(uds: UnixListener, service: AveragesService) -> Result<()> {
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<AveragesServer<AveragesService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);

    Server::builder()
        .add_service(health_service)
        .add_service(AveragesServer::new(service))
        .serve_with_incoming(incoming)
        .await?;

    Ok(())
}
