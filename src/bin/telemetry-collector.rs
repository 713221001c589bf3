use anyhow::{Context, Result};
use prometheus::Registry;
use sat_telemetry::broker::BrokerGateway;
use sat_telemetry::collector::{self, CollectorState};
use sat_telemetry::config::CollectorConfig;
use sat_telemetry::metrics::CollectorMetrics;
use sat_telemetry::observability::{init_tracing, spawn_shutdown_listener};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let config = CollectorConfig::from_env().context("invalid collector configuration")?;
    init_tracing("telemetry-collector", config.otlp_endpoint.as_deref())?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let gateway = BrokerGateway::connect(config.broker.clone(), cancel.child_token())
        .await
        .context("broker unavailable; refusing to serve")?;
    let watchdog = gateway.spawn_watchdog(cancel.clone());

    let registry = Registry::new();
    let metrics = CollectorMetrics::new(&registry)?;
    let app = collector::router(
        CollectorState {
            publisher: gateway.clone(),
            metrics,
        },
        registry,
    );

    let served = sat_telemetry::http::serve(&config.http_bind, app, cancel.clone()).await;

    cancel.cancel();
    let _ = watchdog.await;
    gateway.close().await;
    served
}
