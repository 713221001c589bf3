use anyhow::{Context, Result};
use prometheus::Registry;
use sat_telemetry::broker::BrokerGateway;
use sat_telemetry::config::ProcessorConfig;
use sat_telemetry::metrics::{self, ProcessorMetrics};
use sat_telemetry::observability::{init_tracing, spawn_shutdown_listener};
use sat_telemetry::processor::{self, StreamProcessor};
use sat_telemetry::store::{bootstrap_schema, build_pool, PgTelemetryStore};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProcessorConfig::from_env().context("invalid processor configuration")?;
    init_tracing("telemetry-processor", config.otlp_endpoint.as_deref())?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    bootstrap_schema(&pool)
        .await
        .context("failed to bootstrap telemetry schema")?;

    let gateway = BrokerGateway::connect(config.broker.clone(), cancel.child_token())
        .await
        .context("broker unavailable; refusing to consume")?;
    let watchdog = gateway.spawn_watchdog(cancel.clone());

    let registry = Registry::new();
    let processor = StreamProcessor::new(
        PgTelemetryStore::new(pool.clone()),
        ProcessorMetrics::new(&registry)?,
        config.persist_retry_backoff,
    );

    let http_bind = config.http_bind.clone();
    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = sat_telemetry::http::serve(&http_bind, metrics::router(registry), http_cancel).await {
            tracing::error!(error = %err, "metrics server exited");
        }
    });

    let result = processor::run(&gateway, &processor, &cancel).await;

    cancel.cancel();
    let _ = http_handle.await;
    let _ = watchdog.await;
    gateway.close().await;
    pool.close().await;
    result.context("stream processor stopped on a fatal broker error")
}
