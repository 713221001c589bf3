//! Synthetic fleet: one document per satellite per cycle, published straight to the queue.

use crate::broker::{Route, TelemetryPublisher};
use crate::config::GeneratorConfig;
use crate::error::BrokerError;
use crate::metrics::GeneratorMetrics;
use crate::telemetry::{LinkStats, TelemetryDocument};
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use statrs::StatsError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub fn sat_id(index: u32) -> String {
    format!("SAT-{index:03}")
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn draw<R: Rng + ?Sized>(dist: &Normal, rng: &mut R) -> f64 {
    rng.sample(dist)
}

/// Value distributions for generated link and battery readings.
#[derive(Debug, Clone)]
pub struct Formulas {
    packet_loss_pct: Normal,
    uplink_mbps: Normal,
    downlink_mbps: Normal,
    battery: Normal,
}

impl Formulas {
    pub fn new() -> Result<Self, StatsError> {
        Ok(Self {
            packet_loss_pct: Normal::new(0.2, 0.15)?,
            uplink_mbps: Normal::new(30.0, 10.0)?,
            downlink_mbps: Normal::new(120.0, 30.0)?,
            battery: Normal::new(75.0, 7.0)?,
        })
    }

    pub fn document<R: Rng + ?Sized>(
        &self,
        sat_id: &str,
        orbit: &str,
        region: &str,
        rng: &mut R,
    ) -> TelemetryDocument {
        let base_latency: f64 = rng.gen_range(25.0..55.0);
        let jitter: f64 = rng.gen_range(0.0..15.0);
        let latency_ms = base_latency + rng.gen_range(-jitter..=jitter);

        let link = LinkStats {
            uplink_mbps: Some(round2(draw(&self.uplink_mbps, rng).max(5.0))),
            downlink_mbps: Some(round2(draw(&self.downlink_mbps, rng).max(20.0))),
            latency_ms: Some(round2(latency_ms)),
            packet_loss_pct: Some(round2(draw(&self.packet_loss_pct, rng).max(0.0))),
        };

        TelemetryDocument {
            sat_id: sat_id.to_string(),
            orbit: orbit.to_string(),
            region: region.to_string(),
            ts: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            battery: Some(round2(draw(&self.battery, rng).clamp(5.0, 100.0))),
            link: Some(link),
        }
    }
}

pub struct Generator {
    publisher: Arc<dyn TelemetryPublisher>,
    metrics: GeneratorMetrics,
    formulas: Formulas,
    sat_count: u32,
    rate_hz: f64,
    orbit: String,
    regions: Vec<String>,
    cycle_interval: Duration,
    retry_delay: Duration,
}

impl Generator {
    pub fn new(
        config: &GeneratorConfig,
        publisher: Arc<dyn TelemetryPublisher>,
        metrics: GeneratorMetrics,
    ) -> anyhow::Result<Self> {
        let formulas = Formulas::new().context("invalid generator distributions")?;
        Ok(Self {
            publisher,
            metrics,
            formulas,
            sat_count: config.sat_count,
            rate_hz: config.rate_hz,
            orbit: config.orbit.clone(),
            regions: config.regions.clone(),
            cycle_interval: config.cycle_interval(),
            retry_delay: config.broker.connect_delay,
        })
    }

    pub fn metrics(&self) -> &GeneratorMetrics {
        &self.metrics
    }

    /// Generates until cancelled. Only a fatal broker error ends the loop early.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.metrics.rate_hz.set(self.rate_hz);
        self.metrics.sat_count.set(f64::from(self.sat_count));
        tracing::info!(
            sat_count = self.sat_count,
            rate_hz = self.rate_hz,
            orbit = %self.orbit,
            regions = ?self.regions,
            "generator started"
        );

        let mut rng = StdRng::from_entropy();
        'cycles: loop {
            for index in 0..self.sat_count {
                if cancel.is_cancelled() {
                    break 'cycles;
                }
                let id = sat_id(index);
                let region = self
                    .regions
                    .choose(&mut rng)
                    .map(String::as_str)
                    .unwrap_or(crate::telemetry::UNKNOWN);
                let doc = self.formulas.document(&id, &self.orbit, region, &mut rng);
                if !self.publish(&doc, cancel).await? {
                    break 'cycles;
                }
                self.observe(&doc);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cycle_interval) => {}
            }
        }

        tracing::info!("generator stopped");
        Ok(())
    }

    /// Publishes one document, retrying transient failures. `Ok(false)` means
    /// cancellation arrived before the document went out.
    async fn publish(&self, doc: &TelemetryDocument, cancel: &CancellationToken) -> Result<bool, BrokerError> {
        let body = match serde_json::to_vec(doc) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, sat_id = %doc.sat_id, "failed to encode document");
                return Ok(true);
            }
        };

        loop {
            let started = Instant::now();
            match self.publisher.publish(Route::Queue, &body).await {
                Ok(()) => {
                    self.metrics
                        .publish_seconds
                        .observe(started.elapsed().as_secs_f64());
                    return Ok(true);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.metrics.publish_failures_total.inc();
                    tracing::warn!(error = %err, sat_id = %doc.sat_id, "publish failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    fn observe(&self, doc: &TelemetryDocument) {
        let sat = [doc.sat_id.as_str()];
        self.metrics
            .generated_total
            .with_label_values(&[doc.sat_id.as_str(), doc.orbit.as_str(), doc.region.as_str()])
            .inc();
        if let Some(battery) = doc.battery {
            self.metrics.battery.with_label_values(&sat).observe(battery);
        }
        let Some(link) = &doc.link else {
            return;
        };
        if let Some(value) = link.latency_ms {
            self.metrics.latency_ms.with_label_values(&sat).observe(value);
        }
        if let Some(value) = link.packet_loss_pct {
            self.metrics.packet_loss_pct.with_label_values(&sat).observe(value);
        }
        if let Some(value) = link.uplink_mbps {
            self.metrics.uplink_mbps.with_label_values(&sat).observe(value);
        }
        if let Some(value) = link.downlink_mbps {
            self.metrics.downlink_mbps.with_label_values(&sat).observe(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;
    use crate::telemetry;
    use async_trait::async_trait;
    use prometheus::Registry;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FleetPublisher {
        fail_first: AtomicUsize,
        fatal: bool,
        cancel_after: usize,
        cancel: CancellationToken,
        published: Mutex<Vec<(Route, Value)>>,
    }

    impl FleetPublisher {
        fn new(cancel_after: usize, cancel: CancellationToken) -> Self {
            Self {
                fail_first: AtomicUsize::new(0),
                fatal: false,
                cancel_after,
                cancel,
                published: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TelemetryPublisher for FleetPublisher {
        async fn publish(&self, route: Route, body: &[u8]) -> Result<(), BrokerError> {
            if self.fatal {
                return Err(BrokerError::Closed);
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BrokerError::Unavailable);
            }
            let mut published = self.published.lock().unwrap();
            published.push((route, serde_json::from_slice(body).unwrap()));
            if published.len() >= self.cancel_after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    fn config(sat_count: u32) -> GeneratorConfig {
        GeneratorConfig {
            broker: BrokerSettings {
                url: "amqp://localhost".to_string(),
                queue: "telemetry.raw".to_string(),
                exchange: "telemetry".to_string(),
                routing_key: "raw".to_string(),
                connect_attempts: 1,
                connect_delay: Duration::ZERO,
                watchdog_interval: Duration::from_secs(1),
                prefetch: 1,
                connection_name: "generator-test".to_string(),
            },
            rate_hz: 50.0,
            sat_count,
            orbit: "MEO".to_string(),
            regions: vec!["EU".to_string(), "US".to_string()],
            http_bind: "127.0.0.1:0".to_string(),
            otlp_endpoint: None,
        }
    }

    fn generator(sat_count: u32, publisher: Arc<FleetPublisher>) -> Generator {
        let metrics = GeneratorMetrics::new(&Registry::new()).unwrap();
        Generator::new(&config(sat_count), publisher, metrics).unwrap()
    }

    fn is_rounded(value: f64) -> bool {
        ((value * 100.0).round() - value * 100.0).abs() < 1e-6
    }

    #[test]
    fn sat_ids_are_zero_padded() {
        assert_eq!(sat_id(0), "SAT-000");
        assert_eq!(sat_id(42), "SAT-042");
        assert_eq!(sat_id(1234), "SAT-1234");
    }

    #[test]
    fn generated_values_stay_in_range() {
        let formulas = Formulas::new().unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..1_000 {
            let doc = formulas.document("SAT-001", "LEO", "EU", &mut rng);
            let battery = doc.battery.unwrap();
            let link = doc.link.clone().unwrap();
            let latency = link.latency_ms.unwrap();
            let loss = link.packet_loss_pct.unwrap();
            let up = link.uplink_mbps.unwrap();
            let down = link.downlink_mbps.unwrap();

            assert!((5.0..=100.0).contains(&battery), "battery {battery}");
            assert!((10.0..=70.0).contains(&latency), "latency {latency}");
            assert!(loss >= 0.0);
            assert!(up >= 5.0);
            assert!(down >= 20.0);
            for value in [battery, latency, loss, up, down] {
                assert!(is_rounded(value), "{value} not rounded");
            }
        }
    }

    #[test]
    fn generated_documents_decode_without_defaults() {
        let formulas = Formulas::new().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let doc = formulas.document("SAT-003", "LEO", "US", &mut rng);
        let body = serde_json::to_vec(&doc).unwrap();

        let decoded = telemetry::decode(&body);

        assert!(!decoded.malformed);
        assert_eq!(decoded.document, doc);
        let ts = doc.ts.as_deref().unwrap();
        assert!(telemetry::parse_timestamp(ts).is_some());
        assert!(ts.ends_with('Z'));
    }

    #[tokio::test]
    async fn one_cycle_covers_the_fleet_via_the_queue() {
        let cancel = CancellationToken::new();
        let publisher = Arc::new(FleetPublisher::new(3, cancel.clone()));
        let generator = generator(3, publisher.clone());

        generator.run(&cancel).await.unwrap();

        let published = publisher.published.lock().unwrap();
        let ids: Vec<_> = published
            .iter()
            .map(|(_, doc)| doc["sat_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["SAT-000", "SAT-001", "SAT-002"]);
        assert!(published.iter().all(|(route, _)| *route == Route::Queue));
        assert!(published
            .iter()
            .all(|(_, doc)| doc["orbit"] == "MEO" && (doc["region"] == "EU" || doc["region"] == "US")));
        assert_eq!(generator.metrics().sat_count.get(), 3.0);
        assert_eq!(generator.metrics().rate_hz.get(), 50.0);
        assert_eq!(generator.metrics().publish_seconds.get_sample_count(), 3);
    }

    #[tokio::test]
    async fn transient_publish_failures_retry_the_same_document() {
        let cancel = CancellationToken::new();
        let publisher = Arc::new(FleetPublisher::new(2, cancel.clone()));
        publisher.fail_first.store(2, Ordering::SeqCst);
        let generator = generator(2, publisher.clone());

        generator.run(&cancel).await.unwrap();

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].1["sat_id"], "SAT-000");
        assert_eq!(published[1].1["sat_id"], "SAT-001");
        assert_eq!(generator.metrics().publish_failures_total.get(), 2);
    }

    #[tokio::test]
    async fn fatal_broker_error_stops_the_loop() {
        let cancel = CancellationToken::new();
        let mut publisher = FleetPublisher::new(usize::MAX, cancel.clone());
        publisher.fatal = true;
        let generator = generator(2, Arc::new(publisher));

        let result = generator.run(&cancel).await;

        assert!(matches!(result, Err(BrokerError::Closed)));
        assert_eq!(generator.metrics().publish_failures_total.get(), 0);
    }
}
