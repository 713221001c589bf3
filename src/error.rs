use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Failures surfaced by the broker gateway.
///
/// `Connect` is fatal at startup. `Transport` and `NotConfirmed` are transient:
/// the gateway rebuilds its session and the caller may retry the operation.
/// `Unavailable` means a rebuild was abandoned because the gateway is shutting down.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },
    #[error("broker transport error: {0}")]
    Transport(#[from] lapin::Error),
    #[error("broker session unavailable")]
    Unavailable,
    #[error("broker gateway closed")]
    Closed,
    #[error("publish was not confirmed by the broker")]
    NotConfirmed,
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Connect { .. } | BrokerError::Closed)
    }
}

/// A database error during insert. The triggering message must not be acknowledged.
#[derive(Debug, thiserror::Error)]
#[error("failed to persist telemetry document: {0}")]
pub struct PersistFailure(#[from] pub sqlx::Error);

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        tracing::error!(error = %err, "failed to enqueue telemetry");
        AppError::unavailable("telemetry could not be queued")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
