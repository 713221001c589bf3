//! Prometheus metrics for the three services.
//!
//! Metric names are an operational contract with existing dashboards and must
//! not change. Each service registers into its own [`Registry`] so tests can
//! inspect values in isolation.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry, TextEncoder,
};

const SAT_LABELS: &[&str] = &["sat_id", "orbit", "region"];

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let metric = Gauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let metric = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Option<Vec<f64>>,
) -> prometheus::Result<Histogram> {
    let mut opts = HistogramOpts::new(name, help);
    if let Some(buckets) = buckets {
        opts = opts.buckets(buckets);
    }
    let metric = Histogram::with_opts(opts)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> prometheus::Result<HistogramVec> {
    let metric = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Series labels for the per-satellite last-value gauges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SatelliteLabels<'a> {
    pub sat_id: &'a str,
    pub orbit: &'a str,
    pub region: &'a str,
}

impl<'a> SatelliteLabels<'a> {
    fn values(&self) -> [&'a str; 3] {
        [self.sat_id, self.orbit, self.region]
    }
}

#[derive(Clone)]
pub struct ProcessorMetrics {
    pub ingested_total: IntCounter,
    pub ingested_by_sat_total: IntCounterVec,
    pub processing_latency: Histogram,
    pub db_errors_total: IntCounter,
    pub ingest_lag: Histogram,
    pub db_write: Histogram,
    pub malformed_total: IntCounter,
    pub redelivered_total: IntCounter,
    pub sat_battery: GaugeVec,
    pub sat_uplink_mbps: GaugeVec,
    pub sat_downlink_mbps: GaugeVec,
    pub sat_latency_ms: GaugeVec,
    pub sat_packet_loss_pct: GaugeVec,
}

impl ProcessorMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            ingested_total: counter(registry, "telemetry_ingested_total", "Total msgs")?,
            ingested_by_sat_total: counter_vec(
                registry,
                "telemetry_ingested_by_sat_total",
                "Total msgs by satellite",
                &["sat_id", "region"],
            )?,
            processing_latency: histogram(
                registry,
                "telemetry_processing_latency_seconds",
                "End-to-end processing latency seconds",
                Some(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
            )?,
            db_errors_total: counter(registry, "telemetry_db_errors_total", "DB errors total")?,
            ingest_lag: histogram(
                registry,
                "telemetry_ingest_lag_seconds",
                "Ingest lag seconds",
                None,
            )?,
            db_write: histogram(registry, "telemetry_db_write_seconds", "DB write seconds", None)?,
            malformed_total: counter(
                registry,
                "telemetry_malformed_total",
                "Message bodies that could not be decoded as a telemetry document",
            )?,
            redelivered_total: counter(
                registry,
                "telemetry_redelivered_total",
                "Deliveries flagged as redelivered by the broker",
            )?,
            sat_battery: gauge_vec(registry, "sat_battery_percent", "Battery %", SAT_LABELS)?,
            sat_uplink_mbps: gauge_vec(registry, "sat_link_uplink_mbps", "Uplink Mbps", SAT_LABELS)?,
            sat_downlink_mbps: gauge_vec(
                registry,
                "sat_link_downlink_mbps",
                "Downlink Mbps",
                SAT_LABELS,
            )?,
            sat_latency_ms: gauge_vec(registry, "sat_link_latency_ms", "RTT latency ms", SAT_LABELS)?,
            sat_packet_loss_pct: gauge_vec(
                registry,
                "sat_link_packet_loss_pct",
                "Packet loss %",
                SAT_LABELS,
            )?,
        })
    }

    pub fn set_battery(&self, labels: &SatelliteLabels<'_>, value: f64) {
        self.sat_battery.with_label_values(&labels.values()).set(value);
    }

    pub fn set_uplink(&self, labels: &SatelliteLabels<'_>, value: f64) {
        self.sat_uplink_mbps.with_label_values(&labels.values()).set(value);
    }

    pub fn set_downlink(&self, labels: &SatelliteLabels<'_>, value: f64) {
        self.sat_downlink_mbps.with_label_values(&labels.values()).set(value);
    }

    pub fn set_latency(&self, labels: &SatelliteLabels<'_>, value: f64) {
        self.sat_latency_ms.with_label_values(&labels.values()).set(value);
    }

    pub fn set_packet_loss(&self, labels: &SatelliteLabels<'_>, value: f64) {
        self.sat_packet_loss_pct.with_label_values(&labels.values()).set(value);
    }
}

#[derive(Clone)]
pub struct CollectorMetrics {
    pub ingest_total: IntCounter,
    pub ingest_bytes: IntCounter,
    pub last_ingest_unixtime: Gauge,
    pub collected_total: IntCounterVec,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
}

impl CollectorMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            ingest_total: counter(registry, "telemetry_http_ingest_total", "Total HTTP ingests")?,
            ingest_bytes: counter(registry, "telemetry_http_ingest_bytes", "Total payload bytes")?,
            last_ingest_unixtime: gauge(
                registry,
                "telemetry_http_last_ingest_unixtime",
                "Last ingest unixtime",
            )?,
            collected_total: counter_vec(
                registry,
                "telemetry_collected_total",
                "Accepted telemetry events",
                &["sat_id", "region"],
            )?,
            http_requests_total: counter_vec(
                registry,
                "http_requests_total",
                "Total number of requests by method, status and handler.",
                &["method", "status", "handler"],
            )?,
            http_request_duration: histogram_vec(
                registry,
                "http_request_duration_seconds",
                "Latency with only few buckets by handler.",
                &["method", "handler"],
                vec![0.1, 0.5, 1.0],
            )?,
        })
    }
}

#[derive(Clone)]
pub struct GeneratorMetrics {
    pub generated_total: IntCounterVec,
    pub battery: HistogramVec,
    pub latency_ms: HistogramVec,
    pub packet_loss_pct: HistogramVec,
    pub uplink_mbps: HistogramVec,
    pub downlink_mbps: HistogramVec,
    pub rate_hz: Gauge,
    pub sat_count: Gauge,
    pub publish_seconds: Histogram,
    pub publish_failures_total: IntCounter,
}

impl GeneratorMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            generated_total: counter_vec(
                registry,
                "telemetry_generated_total",
                "Messages generated per satellite",
                SAT_LABELS,
            )?,
            battery: histogram_vec(
                registry,
                "telemetry_sat_battery",
                "Battery level distribution per satellite",
                &["sat_id"],
                vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0],
            )?,
            latency_ms: histogram_vec(
                registry,
                "telemetry_link_latency_ms",
                "Link latency distribution (ms) per satellite",
                &["sat_id"],
                vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 100.0, 150.0, 200.0],
            )?,
            packet_loss_pct: histogram_vec(
                registry,
                "telemetry_link_packet_loss_pct",
                "Packet loss distribution (%) per satellite",
                &["sat_id"],
                vec![0.0, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0],
            )?,
            uplink_mbps: histogram_vec(
                registry,
                "telemetry_link_uplink_mbps",
                "Uplink throughput distribution per satellite",
                &["sat_id"],
                vec![1.0, 5.0, 10.0, 20.0, 50.0, 100.0],
            )?,
            downlink_mbps: histogram_vec(
                registry,
                "telemetry_link_downlink_mbps",
                "Downlink throughput distribution per satellite",
                &["sat_id"],
                vec![10.0, 50.0, 100.0, 150.0, 200.0, 300.0],
            )?,
            rate_hz: gauge(registry, "telemetry_generator_rate_hz", "Configured generation rate (Hz)")?,
            sat_count: gauge(registry, "telemetry_generator_sat_count", "Configured satellites count")?,
            publish_seconds: histogram(
                registry,
                "telemetry_generator_publish_seconds",
                "Time to publish a single message",
                None,
            )?,
            publish_failures_total: counter(
                registry,
                "telemetry_generator_publish_failures_total",
                "Publish attempts that failed and were retried",
            )?,
        })
    }
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
}

async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// `GET /metrics` for a registry, ready to merge into a service router.
pub fn router<S>(registry: Registry) -> Router<S> {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}
