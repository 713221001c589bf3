//! HTTP ingestion: `POST /ingest` republishes each document to the telemetry exchange.

use crate::broker::{Route, TelemetryPublisher};
use crate::error::{AppError, AppResult};
use crate::metrics::{self, CollectorMetrics};
use crate::telemetry::TelemetryDocument;
use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use prometheus::Registry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct CollectorState {
    pub publisher: Arc<dyn TelemetryPublisher>,
    pub metrics: CollectorMetrics,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ingest(
    State(state): State<CollectorState>,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    if !payload.is_object() {
        return Err(AppError::unprocessable("telemetry document must be a JSON object"));
    }
    let body = serde_json::to_vec(&payload)
        .map_err(|err| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let doc = TelemetryDocument::from_value(&payload);

    state.metrics.ingest_total.inc();
    state.metrics.ingest_bytes.inc_by(body.len() as u64);
    state
        .metrics
        .last_ingest_unixtime
        .set(Utc::now().timestamp_millis() as f64 / 1000.0);
    state
        .metrics
        .collected_total
        .with_label_values(&[doc.sat_id.as_str(), doc.region.as_str()])
        .inc();

    state.publisher.publish(Route::Exchange, &body).await?;
    tracing::debug!(sat_id = %doc.sat_id, bytes = body.len(), "telemetry queued");

    Ok(Json(json!({ "queued": true })))
}

/// Counts and times matched requests. Installed as a route layer, so unmatched
/// paths never reach it.
async fn track_requests(
    State(metrics): State<CollectorMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_owned();
    let handler = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned());
    let started = Instant::now();

    let response = next.run(request).await;

    if let Some(handler) = handler {
        let status = format!("{}xx", response.status().as_u16() / 100);
        metrics
            .http_requests_total
            .with_label_values(&[method.as_str(), status.as_str(), handler.as_str()])
            .inc();
        metrics
            .http_request_duration
            .with_label_values(&[method.as_str(), handler.as_str()])
            .observe(started.elapsed().as_secs_f64());
    }
    response
}

/// The collector's full HTTP surface. `/metrics` is merged outside the
/// instrumentation layer.
pub fn router(state: CollectorState, registry: Registry) -> Router {
    let instrumented = state.metrics.clone();
    Router::new()
        .route("/ingest", post(ingest))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route_layer(middleware::from_fn_with_state(instrumented, track_requests))
        .with_state(state)
        .merge(metrics::router(registry))
}
