use anyhow::{Context, Result};
use prometheus::Registry;
use sat_telemetry::broker::BrokerGateway;
use sat_telemetry::config::GeneratorConfig;
use sat_telemetry::generator::Generator;
use sat_telemetry::metrics::{self, GeneratorMetrics};
use sat_telemetry::observability::{init_tracing, spawn_shutdown_listener};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GeneratorConfig::from_env().context("invalid generator configuration")?;
    init_tracing("telemetry-generator", config.otlp_endpoint.as_deref())?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let gateway = BrokerGateway::connect(config.broker.clone(), cancel.child_token())
        .await
        .context("broker unavailable; refusing to start")?;
    let watchdog = gateway.spawn_watchdog(cancel.clone());

    let registry = Registry::new();
    let generator = Generator::new(&config, gateway.clone(), GeneratorMetrics::new(&registry)?)?;

    let http_bind = config.http_bind.clone();
    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = sat_telemetry::http::serve(&http_bind, metrics::router(registry), http_cancel).await {
            tracing::error!(error = %err, "metrics server exited");
        }
    });

    let result = generator.run(&cancel).await;

    cancel.cancel();
    let _ = http_handle.await;
    let _ = watchdog.await;
    gateway.close().await;
    result.context("generator stopped on a fatal broker error")
}
