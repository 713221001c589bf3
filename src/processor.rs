//! Consume → persist → acknowledge.
//!
//! Each delivery moves through decode, lag computation, persistence, gauge
//! updates and acknowledgement, strictly one message at a time. A message is
//! acknowledged only after its row is committed; a [`PersistFailure`] sends it
//! back to the queue instead. Duplicates after a lost ack are accepted.


use crate::broker::BrokerGateway;
use crate::error::{BrokerError, PersistFailure};
use crate::metrics::{ProcessorMetrics, SatelliteLabels};
use crate::store::{StoredRecord, TelemetryStore};
use crate::telemetry::{self, TelemetryDocument};
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::fmt::Display;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A consumed message that can be settled with the broker exactly once.
#[async_trait]
pub trait InboundMessage: Send {
    fn body(&self) -> &[u8];
    fn redelivered(&self) -> bool;
    async fn acknowledge(self) -> Result<(), BrokerError>;
    /// Negative acknowledgement; the broker puts the message back on the queue.
    async fn reject_requeue(self) -> Result<(), BrokerError>;
}

#[async_trait]
impl InboundMessage for Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn acknowledge(self) -> Result<(), BrokerError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject_requeue(self) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProcessedMessage {
    pub record: StoredRecord,
    pub document: TelemetryDocument,
    pub lag_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Cancelled,
    StreamEnded,
    TransportLost,
}

pub struct StreamProcessor<S> {
    store: S,
    metrics: ProcessorMetrics,
    persist_retry_backoff: Duration,
}

impl<S: TelemetryStore> StreamProcessor<S> {
    pub fn new(store: S, metrics: ProcessorMetrics, persist_retry_backoff: Duration) -> Self {
        Self {
            store,
            metrics,
            persist_retry_backoff,
        }
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    /// Decode, record lag, persist and update gauges. Does not settle the message.
    pub async fn process(&self, body: &[u8]) -> Result<ProcessedMessage, PersistFailure> {
        let decoded = telemetry::decode(body);
        if decoded.malformed {
            self.metrics.malformed_total.inc();
            tracing::warn!(len = body.len(), "telemetry body is not a JSON object; using defaults");
        }

        let lag_seconds = telemetry::ingest_lag_seconds(decoded.document.ts.as_deref(), Utc::now());
        self.metrics.ingest_lag.observe(lag_seconds);

        let write_started = Instant::now();
        let result = self.store.insert(&decoded.payload).await;
        self.metrics
            .db_write
            .observe(write_started.elapsed().as_secs_f64());

        let record = match result {
            Ok(record) => record,
            Err(err) => {
                self.metrics.db_errors_total.inc();
                tracing::error!(error = %err, sat_id = %decoded.document.sat_id, "insert failed");
                return Err(err);
            }
        };

        self.update_gauges(&decoded.document);

        Ok(ProcessedMessage {
            record,
            document: decoded.document,
            lag_seconds,
        })
    }

    fn update_gauges(&self, doc: &TelemetryDocument) {
        let labels = SatelliteLabels {
            sat_id: &doc.sat_id,
            orbit: &doc.orbit,
            region: &doc.region,
        };
        if let Some(battery) = doc.battery {
            self.metrics.set_battery(&labels, battery);
        }
        if let Some(link) = &doc.link {
            if let Some(value) = link.uplink_mbps {
                self.metrics.set_uplink(&labels, value);
            }
            if let Some(value) = link.downlink_mbps {
                self.metrics.set_downlink(&labels, value);
            }
            if let Some(value) = link.latency_ms {
                self.metrics.set_latency(&labels, value);
            }
            if let Some(value) = link.packet_loss_pct {
                self.metrics.set_packet_loss(&labels, value);
            }
        }
    }

    /// Processes one message and settles it: ack on success, requeue on persist failure.
    ///
    /// An `Err` means the broker could not be told; the message stays unacked
    /// and will be redelivered once the session is rebuilt.
    pub async fn handle<M: InboundMessage>(&self, message: M) -> Result<Disposition, BrokerError> {
        let received = Instant::now();
        if message.redelivered() {
            self.metrics.redelivered_total.inc();
        }

        let outcome = self.process(message.body()).await;
        match outcome {
            Ok(processed) => {
                message.acknowledge().await?;
                self.metrics.ingested_total.inc();
                self.metrics
                    .ingested_by_sat_total
                    .with_label_values(&[
                        processed.document.sat_id.as_str(),
                        processed.document.region.as_str(),
                    ])
                    .inc();
                self.metrics
                    .processing_latency
                    .observe(received.elapsed().as_secs_f64());
                tracing::debug!(
                    id = processed.record.id,
                    sat_id = %processed.document.sat_id,
                    lag_seconds = processed.lag_seconds,
                    "telemetry stored"
                );
                Ok(Disposition::Acknowledged)
            }
            Err(_) => {
                message.reject_requeue().await?;
                Ok(Disposition::Requeued)
            }
        }
    }

    /// Drains one consumer stream in delivery order until it ends, the
    /// transport fails, or `cancel` fires. The message in hand is always
    /// settled before cancellation is observed.
    pub async fn run_consumer<St, M, E>(&self, deliveries: St, cancel: &CancellationToken) -> ConsumerExit
    where
        St: Stream<Item = Result<M, E>>,
        M: InboundMessage,
        E: Display,
    {
        tokio::pin!(deliveries);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ConsumerExit::Cancelled,
                next = deliveries.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "consumer stream failed");
                    return ConsumerExit::TransportLost;
                }
                None => return ConsumerExit::StreamEnded,
            };

            match self.handle(message).await {
                Ok(Disposition::Acknowledged) => {}
                Ok(Disposition::Requeued) => {
                    if !self.persist_retry_backoff.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return ConsumerExit::Cancelled,
                            _ = tokio::time::sleep(self.persist_retry_backoff) => {}
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "could not settle message; it will be redelivered");
                    return ConsumerExit::TransportLost;
                }
            }
        }
    }
}

/// Consumes from the gateway until cancelled, resubscribing after transport loss.
///
/// Returns an error only when the gateway cannot be restored within its retry
/// budget or was closed underneath the loop.
pub async fn run<S: TelemetryStore>(
    gateway: &BrokerGateway,
    processor: &StreamProcessor<S>,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    let consumer_tag = format!("telemetry-processor-{}", uuid::Uuid::new_v4());

    while !cancel.is_cancelled() {
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            subscribed = gateway.consume(&consumer_tag) => subscribed,
        };
        let consumer = match subscribed {
            Ok(consumer) => consumer,
            Err(err) if err.is_fatal() && !cancel.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "failed to start consumer; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(gateway.settings().connect_delay) => {}
                }
                continue;
            }
        };

        match processor.run_consumer(consumer, cancel).await {
            ConsumerExit::Cancelled => break,
            exit => {
                tracing::warn!(?exit, reconnects = gateway.reconnects(), "consumer stopped; resubscribing");
            }
        }
    }

    tracing::info!("stream processor stopped");
    Ok(())
}
