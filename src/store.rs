use crate::error::PersistFailure;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Arbitrary key shared by every process that bootstraps the schema.
const SCHEMA_LOCK_KEY: i64 = 0x5a7_7e1e;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

/// Append-only sink for raw telemetry documents.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Inserts one document in its own transaction.
    async fn insert(&self, payload: &Value) -> Result<StoredRecord, PersistFailure>;
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Creates the telemetry table and its GIN index if absent.
///
/// Concurrent callers serialize on a transaction-scoped advisory lock, so two
/// processors starting together never trip over each other's DDL.
pub async fn bootstrap_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry (
            id SERIAL PRIMARY KEY,
            ts timestamptz NOT NULL DEFAULT now(),
            data jsonb NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS telemetry_gin ON telemetry USING GIN (data)")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!("telemetry schema ready");
    Ok(())
}

#[derive(Clone)]
pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn insert(&self, payload: &Value) -> Result<StoredRecord, PersistFailure> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("INSERT INTO telemetry (data) VALUES ($1) RETURNING id, ts")
            .bind(SqlJson(payload))
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoredRecord {
            id: row.try_get::<i32, _>("id")? as i64,
            received_at: row.try_get::<DateTime<Utc>, _>("ts")?,
            payload: payload.clone(),
        })
    }
}
