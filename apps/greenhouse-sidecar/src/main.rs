mod averaging;
mod breaker;
mod config;
mod grpc;
mod mqtt;
mod pipeline;
mod sink;
mod telemetry;

use crate::averaging::{spawn_flush_loop, WindowAccumulator, WindowAggregator};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::grpc::{bind_uds, serve_uds, AveragesService};
use crate::pipeline::{spawn_worker, IngestStats};
use crate::sink::{AverageSink, TimescaleSink};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,greenhouse_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "greenhouse-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("listening for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn connect_sink(config: &Config) -> Result<Option<TimescaleSink>> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("no database URL configured; window averages will not be persisted");
        return Ok(None);
    };
    let sink = TimescaleSink::connect(database_url, config.db_pool_size).await?;
    sink.ensure_schema()
        .await
        .context("creating sensor_averages table")?;
    Ok(Some(sink))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let timescale = connect_sink(&config).await?;
    let grpc_listener = bind_uds(&config.grpc_socket_path).await?;
    let sink = timescale
        .clone()
        .map(|sink| Arc::new(sink) as Arc<dyn AverageSink>);

    let stats = Arc::new(IngestStats::new());
    let accumulator = Arc::new(WindowAccumulator::new());
    let gate = Arc::new(CircuitBreaker::new(config.breaker_config()));
    let aggregator = Arc::new(WindowAggregator::new(
        accumulator.clone(),
        gate,
        sink,
        stats.clone(),
    ));
    let (pipeline, rx) = pipeline::channel(config.queue_capacity, stats.clone());

    let worker_cancel = CancellationToken::new();
    let worker_handle = spawn_worker(rx, accumulator, stats.clone(), worker_cancel.clone());

    let flush_cancel = CancellationToken::new();
    let flush_handle = spawn_flush_loop(aggregator.clone(), config.window(), flush_cancel.clone());

    let grpc_service = AveragesService::new(aggregator.clone(), pipeline.clone());
    let mut grpc_handle = tokio::spawn(serve_uds(grpc_listener, grpc_service));

    let mqtt_cancel = CancellationToken::new();
    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let pipeline_clone = pipeline.clone();
        let cancel = mqtt_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = mqtt::run_listener(config_clone, pipeline_clone, cancel).await {
                tracing::error!(error=%err, "MQTT listener exited");
            }
        }))
    } else {
        tracing::info!("MQTT listener disabled");
        None
    };

    tracing::info!(
        window_secs = config.window_secs,
        queue_capacity = config.queue_capacity,
        persistence = timescale.is_some(),
        "greenhouse sidecar started"
    );

    let mut server_error = None;
    tokio::select! {
        res = &mut grpc_handle => {
            match res {
                Ok(Err(err)) => {
                    tracing::error!(error=%err, "gRPC server exited");
                    server_error = Some(err);
                }
                Err(err) => {
                    tracing::error!(error=%err, "gRPC task failed");
                    server_error = Some(anyhow::Error::new(err).context("gRPC task failed"));
                }
                Ok(Ok(())) => tracing::warn!("gRPC server stopped"),
            }
        }
        res = shutdown_signal() => {
            match res {
                Ok(()) => tracing::info!("shutdown signal received"),
                Err(err) => {
                    tracing::error!(error=%err, "signal handling failed; shutting down");
                    server_error = Some(err);
                }
            }
        }
    }

    flush_cancel.cancel();
    if let Err(err) = flush_handle.await {
        tracing::warn!(error=%err, "flush loop task failed");
    }

    mqtt_cancel.cancel();
    if let Some(handle) = mqtt_handle {
        if let Err(err) = handle.await {
            tracing::warn!(error=%err, "MQTT task failed");
        }
    }

    worker_cancel.cancel();
    if let Err(err) = worker_handle.await {
        tracing::warn!(error=%err, "ingest worker task failed");
    }
    drop(pipeline);

    grpc_handle.abort();
    aggregator.wait_idle().await;
    if let Some(sink) = timescale {
        sink.close().await;
    }

    tracing::info!("greenhouse sidecar stopped");
    match server_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
