//! Consume a Kafka topic and deliver its records in batches to TimescaleDB or MQTT.
use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use common_kafka::PartitionedConsumer;
use sink_worker::app_context::AppContext;
use sink_worker::config::{Config, LogFormat};
use sink_worker::consumer::consume;
use sink_worker::delivery;
use sink_worker::health::HealthRegistry;
use sink_worker::router::PartitionRouter;
use sink_worker::server::{router, serve, setup_metrics_routes};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .init();
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = shutdown.cancelled() => return Ok(()),
    }
    shutdown.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("failed to load configuration")?;
    init_tracing(config.log_format);

    let settings = config.validate().context("invalid configuration")?;
    info!(
        topic = %config.consumer.topic,
        group = %config.consumer.consumer_group,
        batch_size = settings.batch.max_size,
        batch_timeout = ?settings.batch.timeout,
        "starting sink"
    );

    let liveness = HealthRegistry::new("liveness");
    let (consumer, rebalances) = PartitionedConsumer::new(&config.kafka, &config.consumer)
        .context("failed to create kafka consumer")?;
    let consumer = Arc::new(consumer);

    let app =
        setup_metrics_routes(router(liveness.clone())).context("failed to install metrics")?;
    let addr = serve(app, &config.bind())
        .await
        .context("failed to bind the health and metrics endpoints")?;
    info!(%addr, "serving health and metrics endpoints");

    let backend = delivery::connect(&settings)
        .await
        .context("failed to connect to the destination")?;
    let context = Arc::new(AppContext::new(&settings, backend, consumer.clone(), liveness));

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let partition_router = PartitionRouter::new(context.clone(), shutdown.clone());
    let report = consume(
        consumer.as_ref(),
        rebalances,
        partition_router,
        context.clone(),
        shutdown.clone(),
    )
    .await;

    context.delivery.close().await;
    shutdown.cancel();
    signals.await.context("signal handler panicked")??;

    for (partition, stats) in &report.partitions {
        info!(partition, ?stats, "partition summary");
    }
    if !report.is_clean() {
        anyhow::bail!(
            "partitions {:?} halted, resume them from their last committed offset",
            report.halted
        );
    }

    info!("sink stopped");
    Ok(())
}
