use anyhow::{Context, Result};
use clap::Parser;
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::watch;

use staterelay_core::metrics::register_process_metrics;
use staterelay_core::telemetry::{init_telemetry, TelemetryConfig};
use staterelay_core::{
    shutdown_signal, Relay, RelayMetrics, RelayStatus, RoutingKeyParser, StateStore,
};
use staterelay_worker::{AmqpConsumer, Cli, RedisStateBackend, StatusServer, StatusState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment variables take precedence
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Configure via environment variables:
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG: Log filter (default: "info", or "debug" with --debug)
    let mut telemetry_config = TelemetryConfig::from_env().with_default_level(cli.log_level());
    if telemetry_config.service_version.is_none() {
        telemetry_config.service_version = Some(env!("CARGO_PKG_VERSION").to_string());
    }

    // Held until the workers have drained so shutdown spans are exported
    let _telemetry_guard = init_telemetry(telemetry_config);

    let hostname = cli.hostname();
    tracing::info!(
        workers = cli.workers,
        hostname = %hostname,
        prefetch = cli.prefetch,
        "staterelay starting..."
    );

    let registry = Registry::new();
    let metrics = RelayMetrics::new(&registry).context("Failed to register metrics")?;
    register_process_metrics(&registry).context("Failed to register process metrics")?;

    // Status is reported from before the first worker binds
    let (status_tx, status_rx) = watch::channel(RelayStatus::Starting);
    let status_server = StatusServer::start(
        cli.status_addr,
        StatusState {
            registry,
            hostname,
            workers: usize::from(cli.workers),
            status: status_rx,
        },
    )
    .await
    .with_context(|| format!("Failed to bind status listener on {}", cli.status_addr))?;

    let result = run(&cli, metrics, status_tx).await;

    status_server.stop().await;
    result
}

/// Connect the store and broker, relay until a signal arrives, then drain
async fn run(cli: &Cli, metrics: RelayMetrics, status: watch::Sender<RelayStatus>) -> Result<()> {
    let parser = RoutingKeyParser::new().context("Failed to compile routing key pattern")?;
    let backend = RedisStateBackend::connect(&cli.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let store = StateStore::new(parser, Arc::new(backend));

    let consumer = AmqpConsumer::connect(&cli.rabbitmq_url, cli.amqp_settings())
        .await
        .context("Failed to connect to RabbitMQ")?;

    let relay =
        match Relay::start_with_status(cli.relay_config(), &consumer, store, metrics, status).await
        {
            Ok(relay) => relay,
            Err(e) => {
                close_consumer(&consumer).await;
                return Err(e).context("Failed to start workers");
            }
        };

    tracing::info!("Running, press Ctrl+C to stop");

    let report = relay
        .run_until(async {
            let signal = shutdown_signal().await;
            tracing::warn!(signal, "Got signal, shutting down");
        })
        .await;

    close_consumer(&consumer).await;

    for (index, e) in &report.failed {
        tracing::error!(worker = index, error = %e, "Worker did not shut down cleanly");
    }
    tracing::info!(
        processed = report.processed(),
        drained = report.drained.len(),
        failed = report.failed.len(),
        "Shutdown complete"
    );

    Ok(())
}

async fn close_consumer(consumer: &AmqpConsumer) {
    if let Err(e) = consumer.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
}
