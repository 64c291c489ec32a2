//! Postgres persistence.
//!
//! Queries are built at runtime (`sqlx::query`/`query_as`) so the crate
//! compiles without a live database.

use crate::alerts::{AlertStore, Recorded};
use crate::error::AppError;
use crate::model::{
    Alert, AlertMeta, AlertRule, DeliveryChannel, DeliveryOutcome, DeliveryRecord, ImuSample,
    InferenceRecord, Severity, VitalsReading,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    id UUID PRIMARY KEY,
    device_id TEXT NOT NULL,
    rule TEXT NOT NULL,
    value DOUBLE PRECISION,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    ts TIMESTAMPTZ NOT NULL,
    meta JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    email_sent BOOLEAN NOT NULL DEFAULT FALSE,
    email_sent_at TIMESTAMPTZ,
    email_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_alerts_dedup ON alerts (device_id, rule, created_at DESC);

CREATE TABLE IF NOT EXISTS readings (
    id BIGSERIAL PRIMARY KEY,
    device_id TEXT NOT NULL,
    ts TIMESTAMPTZ NOT NULL,
    hr DOUBLE PRECISION NOT NULL,
    spo2 DOUBLE PRECISION NOT NULL,
    flag_hr_low BOOLEAN NOT NULL,
    flag_hr_high BOOLEAN NOT NULL,
    flag_spo2_low BOOLEAN NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_readings_device_ts ON readings (device_id, ts);

CREATE TABLE IF NOT EXISTS imu_samples (
    id BIGSERIAL PRIMARY KEY,
    device_id TEXT NOT NULL,
    ax DOUBLE PRECISION NOT NULL,
    ay DOUBLE PRECISION NOT NULL,
    az DOUBLE PRECISION NOT NULL,
    gx DOUBLE PRECISION NOT NULL,
    gy DOUBLE PRECISION NOT NULL,
    gz DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_imu_device ON imu_samples (device_id, created_at);

CREATE TABLE IF NOT EXISTS fall_probabilities (
    id BIGSERIAL PRIMARY KEY,
    device_id TEXT NOT NULL,
    fall_prob DOUBLE PRECISION NOT NULL,
    is_fall BOOLEAN NOT NULL,
    ts TIMESTAMPTZ NOT NULL,
    model_version TEXT,
    source TEXT NOT NULL DEFAULT 'ml'
);
CREATE INDEX IF NOT EXISTS idx_fall_prob_device_ts ON fall_probabilities (device_id, ts DESC);
"#;

const ALERT_COLUMNS: &str = "id, device_id, rule, value, severity, message, ts, meta, created_at, \
     email_sent, email_sent_at, email_error";

pub async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), AppError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct AlertRow {
    id: Uuid,
    device_id: String,
    rule: String,
    value: Option<f64>,
    severity: String,
    message: String,
    ts: DateTime<Utc>,
    meta: serde_json::Value,
    created_at: DateTime<Utc>,
    email_sent: bool,
    email_sent_at: Option<DateTime<Utc>>,
    email_error: Option<String>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = AppError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let rule: AlertRule = row.rule.parse().map_err(AppError::Corrupt)?;
        let severity: Severity = row.severity.parse().map_err(AppError::Corrupt)?;
        let meta: AlertMeta = serde_json::from_value(row.meta).unwrap_or_default();
        Ok(Alert {
            id: row.id,
            device_id: row.device_id,
            rule,
            value: row.value,
            severity,
            message: row.message,
            ts: row.ts,
            meta,
            created_at: row.created_at,
            email: DeliveryRecord {
                sent: row.email_sent,
                sent_at: row.email_sent_at,
                error: row.email_error,
            },
        })
    }
}

#[derive(Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_alert<'e, E>(executor: E, alert: &Alert) -> Result<(), AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    let meta = serde_json::to_value(&alert.meta).unwrap_or_else(|_| serde_json::json!({}));
    sqlx::query(
        "INSERT INTO alerts (id, device_id, rule, value, severity, message, ts, meta, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(alert.id)
    .bind(&alert.device_id)
    .bind(alert.rule.as_str())
    .bind(alert.value)
    .bind(alert.severity.as_str())
    .bind(&alert.message)
    .bind(alert.ts)
    .bind(meta)
    .bind(alert.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn select_recent<'e, E>(
    executor: E,
    device_id: &str,
    rule: AlertRule,
    since: DateTime<Utc>,
) -> Result<Option<Alert>, AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM alerts WHERE device_id = $1 AND rule = $2 AND created_at >= $3 \
         ORDER BY created_at DESC LIMIT 1",
        ALERT_COLUMNS
    );
    let row = sqlx::query_as::<_, AlertRow>(&sql)
        .bind(device_id)
        .bind(rule.as_str())
        .bind(since)
        .fetch_optional(executor)
        .await?;
    row.map(Alert::try_from).transpose()
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn find_recent(
        &self,
        device_id: &str,
        rule: AlertRule,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>, AppError> {
        select_recent(&self.pool, device_id, rule, since).await
    }

    async fn create(&self, alert: &Alert) -> Result<Alert, AppError> {
        insert_alert(&self.pool, alert).await?;
        Ok(alert.clone())
    }

    async fn mark_delivery(
        &self,
        id: Uuid,
        channel: DeliveryChannel,
        outcome: &DeliveryOutcome,
    ) -> Result<(), AppError> {
        let DeliveryChannel::Email = channel;
        let query = match outcome {
            DeliveryOutcome::Sent { at } => sqlx::query(
                "UPDATE alerts SET email_sent = TRUE, email_sent_at = $2 \
                 WHERE id = $1 AND email_sent = FALSE AND email_error IS NULL",
            )
            .bind(id)
            .bind(*at),
            DeliveryOutcome::Failed { error } => sqlx::query(
                "UPDATE alerts SET email_error = $2 \
                 WHERE id = $1 AND email_sent = FALSE AND email_error IS NULL",
            )
            .bind(id)
            .bind(error.clone()),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Serialized across processes with a transaction-scoped advisory lock
    /// on the `(device, rule)` key.
    async fn create_unless_recent(
        &self,
        alert: &Alert,
        since: DateTime<Utc>,
    ) -> Result<Recorded, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", alert.device_id, alert.rule))
            .execute(&mut *tx)
            .await?;

        if let Some(existing) = select_recent(&mut *tx, &alert.device_id, alert.rule, since).await? {
            tx.commit().await?;
            return Ok(Recorded::Existing(existing.id));
        }
        insert_alert(&mut *tx, alert).await?;
        tx.commit().await?;
        Ok(Recorded::Created(alert.clone()))
    }
}

/// Write-only sink for raw readings and inference results.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn insert_reading(
        &self,
        device_id: &str,
        ts: DateTime<Utc>,
        reading: &VitalsReading,
    ) -> Result<(), AppError>;

    async fn insert_imu(&self, device_id: &str, samples: &[ImuSample]) -> Result<(), AppError>;

    async fn insert_inference(&self, record: &InferenceRecord) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn insert_reading(
        &self,
        device_id: &str,
        ts: DateTime<Utc>,
        reading: &VitalsReading,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO readings (device_id, ts, hr, spo2, flag_hr_low, flag_hr_high, flag_spo2_low) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(device_id)
        .bind(ts)
        .bind(reading.hr)
        .bind(reading.spo2)
        .bind(reading.flags.hr_low)
        .bind(reading.flags.hr_high)
        .bind(reading.flags.spo2_low)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_imu(&self, device_id: &str, samples: &[ImuSample]) -> Result<(), AppError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO imu_samples (device_id, ax, ay, az, gx, gy, gz) ",
        );
        builder.push_values(samples, |mut row, s| {
            row.push_bind(device_id)
                .push_bind(s.ax)
                .push_bind(s.ay)
                .push_bind(s.az)
                .push_bind(s.gx)
                .push_bind(s.gy)
                .push_bind(s.gz);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_inference(&self, record: &InferenceRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO fall_probabilities (device_id, fall_prob, is_fall, ts, model_version, source) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.device_id)
        .bind(record.fall_prob)
        .bind(record.is_fall)
        .bind(record.ts)
        .bind(&record.model_version)
        .bind(&record.source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
