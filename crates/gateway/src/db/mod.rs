//! Postgres persistence layer (via sqlx): sensors, readings, alerts,
//! ml_events, notifications, API keys and CSV job rows.
//!
//! The teacher's `db.rs` uses `sqlx::query!`/`query_as!`, compile-time
//! macros checked against a live database or a committed `.sqlx` cache.
//! Neither is available here, so this module uses the runtime
//! `sqlx::query`/`query_as` functions instead (see DESIGN.md). Everything
//! else — connect/migrate shape, `QueryBuilder` for dynamic batches,
//! upsert via `ON CONFLICT ... DO UPDATE SET excluded.*` — follows the
//! teacher directly.

mod state_store;
mod threshold_loader;

pub use state_store::PgStateStore;
pub use threshold_loader::PgThresholdLoader;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::DbConfig;
use crate::observation::SensorState;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Postgres>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorRow {
    pub id: i64,
    pub stream_uuid: Uuid,
    pub domain: String,
    pub source: String,
    pub stream: String,
    pub legacy_stream_int: Option<i64>,
    pub device_uuid: Option<Uuid>,
    pub sensor_type: String,
    pub operational_state: String,
    pub valid_readings_count: i64,
    pub min_readings_for_normal: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRow {
    pub id: i64,
    pub stream_id: i64,
    pub status: String,
    pub triggered_value: f64,
    pub triggered_at: OffsetDateTime,
}

impl Db {
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size + cfg.pool_overflow)
            .min_connections(1)
            .max_lifetime(Duration::from_secs(cfg.recycle_secs))
            .test_before_acquire(true)
            .connect(&cfg.connection_url())
            .await
            .with_context(|| format!("failed to connect to postgres at {}:{}", cfg.host, cfg.port))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sensor resolution / registry
    // ------------------------------------------------------------------

    pub async fn find_sensor_by_triple(
        &self,
        domain: &str,
        source: &str,
        stream: &str,
    ) -> Result<Option<SensorRow>> {
        let row = sqlx::query(
            "SELECT id, stream_uuid, domain, source, stream, legacy_stream_int, device_uuid, \
             sensor_type, operational_state, valid_readings_count, min_readings_for_normal \
             FROM sensors WHERE domain = $1 AND source = $2 AND stream = $3",
        )
        .bind(domain)
        .bind(source)
        .bind(stream)
        .fetch_optional(&self.pool)
        .await
        .context("find_sensor_by_triple failed")?;

        Ok(row.map(sensor_row_from_row))
    }

    pub async fn find_sensor_by_id(&self, stream_id: i64) -> Result<Option<SensorRow>> {
        let row = sqlx::query(
            "SELECT id, stream_uuid, domain, source, stream, legacy_stream_int, device_uuid, \
             sensor_type, operational_state, valid_readings_count, min_readings_for_normal \
             FROM sensors WHERE id = $1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .context("find_sensor_by_id failed")?;

        Ok(row.map(sensor_row_from_row))
    }

    pub async fn find_sensor_by_legacy_id(&self, legacy_id: i64) -> Result<Option<SensorRow>> {
        let row = sqlx::query(
            "SELECT id, stream_uuid, domain, source, stream, legacy_stream_int, device_uuid, \
             sensor_type, operational_state, valid_readings_count, min_readings_for_normal \
             FROM sensors WHERE legacy_stream_int = $1",
        )
        .bind(legacy_id)
        .fetch_optional(&self.pool)
        .await
        .context("find_sensor_by_legacy_id failed")?;

        Ok(row.map(sensor_row_from_row))
    }

    /// Seeds or refreshes a stream's threshold configuration from the
    /// bootstrap TOML (spec.md §3 "bootstrap config"). Only the threshold
    /// columns are touched on conflict — `operational_state` and
    /// `valid_readings_count` are left alone so a re-applied bootstrap file
    /// doesn't reset a sensor's live classifier state.
    pub async fn upsert_bootstrap_stream(&self, stream: &crate::config::BootstrapStream) -> Result<()> {
        sqlx::query(
            "INSERT INTO sensors (stream_uuid, domain, source, stream, sensor_type, \
             min_readings_for_normal, physical_min, physical_max, warning_min, warning_max, \
             delta_abs, delta_rel, slope_abs, slope_rel, delta_severity, consecutive_required) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
             COALESCE($15, 'warning'), COALESCE($16, 3)) \
             ON CONFLICT (domain, source, stream) DO UPDATE SET \
               sensor_type = excluded.sensor_type, \
               min_readings_for_normal = excluded.min_readings_for_normal, \
               physical_min = excluded.physical_min, \
               physical_max = excluded.physical_max, \
               warning_min = excluded.warning_min, \
               warning_max = excluded.warning_max, \
               delta_abs = excluded.delta_abs, \
               delta_rel = excluded.delta_rel, \
               slope_abs = excluded.slope_abs, \
               slope_rel = excluded.slope_rel, \
               delta_severity = excluded.delta_severity, \
               consecutive_required = excluded.consecutive_required",
        )
        .bind(Uuid::new_v4())
        .bind(&stream.domain)
        .bind(&stream.source)
        .bind(&stream.stream)
        .bind(&stream.sensor_type)
        .bind(stream.min_readings_for_normal as i64)
        .bind(stream.physical_min)
        .bind(stream.physical_max)
        .bind(stream.warning_min)
        .bind(stream.warning_max)
        .bind(stream.delta_abs)
        .bind(stream.delta_rel)
        .bind(stream.slope_abs)
        .bind(stream.slope_rel)
        .bind(stream.delta_severity.as_deref())
        .bind(stream.consecutive_readings_required.map(|n| n as i32))
        .execute(&self.pool)
        .await
        .context("upsert_bootstrap_stream failed")?;
        Ok(())
    }

    pub async fn find_sensor_by_device_and_uuid(
        &self,
        device_uuid: Uuid,
        sensor_uuid: Uuid,
    ) -> Result<Option<SensorRow>> {
        let row = sqlx::query(
            "SELECT id, stream_uuid, domain, source, stream, legacy_stream_int, device_uuid, \
             sensor_type, operational_state, valid_readings_count, min_readings_for_normal \
             FROM sensors WHERE device_uuid = $1 AND stream_uuid = $2",
        )
        .bind(device_uuid)
        .bind(sensor_uuid)
        .fetch_optional(&self.pool)
        .await
        .context("find_sensor_by_device_and_uuid failed")?;

        Ok(row.map(sensor_row_from_row))
    }

    pub async fn insert_reading(
        &self,
        stream_id: i64,
        value: f64,
        ingest_ts: OffsetDateTime,
        device_ts: Option<OffsetDateTime>,
        sequence: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sensor_readings (stream_id, value, ingest_ts, device_ts, sequence) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(stream_id)
        .bind(value)
        .bind(ingest_ts)
        .bind(device_ts)
        .bind(sequence)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Multi-row insert for the batch inserter (spec.md §4.11).
    pub async fn insert_readings_batch(
        &self,
        rows: &[(i64, f64, OffsetDateTime, Option<OffsetDateTime>, Option<i64>)],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO sensor_readings (stream_id, value, ingest_ts, device_ts, sequence) ");
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.0)
                .push_bind(row.1)
                .push_bind(row.2)
                .push_bind(row.3)
                .push_bind(row.4);
        });
        qb.build()
            .execute(&self.pool)
            .await
            .context("insert_readings_batch failed")?;
        Ok(())
    }

    pub async fn get_latest_value(&self, stream_id: i64) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT latest_value FROM sensor_readings_latest WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_latest_value failed")?;
        Ok(row.map(|r| r.get::<f64, _>("latest_value")))
    }

    pub async fn upsert_latest(
        &self,
        stream_id: i64,
        value: f64,
        timestamp: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sensor_readings_latest (stream_id, latest_value, latest_timestamp) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (stream_id) DO UPDATE SET \
               latest_value = excluded.latest_value, \
               latest_timestamp = excluded.latest_timestamp",
        )
        .bind(stream_id)
        .bind(value)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .context("upsert_latest failed")?;
        Ok(())
    }

    /// Upsert the single active alert for a stream (spec.md §4.7).
    pub async fn upsert_active_alert(
        &self,
        stream_id: i64,
        device_id: Option<Uuid>,
        threshold_id: Option<i64>,
        triggered_value: f64,
        triggered_at: OffsetDateTime,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO alerts (stream_id, device_id, threshold_id, severity, status, triggered_value, triggered_at) \
             VALUES ($1, $2, $3, 'critical', 'active', $4, $5) \
             ON CONFLICT (stream_id) WHERE status = 'active' DO UPDATE SET \
               threshold_id = excluded.threshold_id, \
               triggered_value = excluded.triggered_value, \
               triggered_at = excluded.triggered_at \
             RETURNING id",
        )
        .bind(stream_id)
        .bind(device_id)
        .bind(threshold_id)
        .bind(triggered_value)
        .bind(triggered_at)
        .fetch_one(&self.pool)
        .await
        .context("upsert_active_alert failed")?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Upsert the single active DELTA_SPIKE ml_event for a stream (spec.md §4.8).
    pub async fn upsert_active_spike_event(
        &self,
        stream_id: i64,
        device_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO ml_events (stream_id, device_id, event_type, event_code, status, payload) \
             VALUES ($1, $2, 'delta_spike', 'DELTA_SPIKE', 'active', $3) \
             ON CONFLICT (stream_id, event_code) WHERE status = 'active' DO UPDATE SET \
               payload = excluded.payload, created_at = now() \
             RETURNING id",
        )
        .bind(stream_id)
        .bind(device_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .context("upsert_active_spike_event failed")?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Dedup window lookup for alert notifications: an unread notification
    /// for this source/event created within the last 5 minutes blocks a
    /// new one (spec.md §4.7).
    pub async fn has_recent_notification(&self, source: &str, source_event_id: i64) -> Result<bool> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        let row = sqlx::query(
            "SELECT 1 FROM alert_notifications \
             WHERE source = $1 AND source_event_id = $2 AND created_at >= $3 LIMIT 1",
        )
        .bind(source)
        .bind(source_event_id)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .context("has_recent_notification failed")?;
        Ok(row.is_some())
    }

    pub async fn insert_notification(
        &self,
        source: &str,
        source_event_id: i64,
        severity: &str,
        title: &str,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO alert_notifications (source, source_event_id, severity, title, message) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(source)
        .bind(source_event_id)
        .bind(severity)
        .bind(title)
        .bind(message)
        .execute(&self.pool)
        .await
        .context("insert_notification failed")?;
        Ok(())
    }

    pub async fn lookup_device_key(&self, key_hash: &str) -> Result<Option<(Uuid, bool, bool, Option<OffsetDateTime>)>> {
        let row = sqlx::query(
            "SELECT device_uuid, active, revoked, expires_at FROM device_api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .context("lookup_device_key failed")?;
        Ok(row.map(|r| {
            (
                r.get::<Uuid, _>("device_uuid"),
                r.get::<bool, _>("active"),
                r.get::<bool, _>("revoked"),
                r.get::<Option<OffsetDateTime>, _>("expires_at"),
            )
        }))
    }

    pub async fn touch_device_key(&self, key_hash: &str) -> Result<()> {
        sqlx::query("UPDATE device_api_keys SET last_used_at = now() WHERE key_hash = $1")
            .bind(key_hash)
            .execute(&self.pool)
            .await
            .context("touch_device_key failed")?;
        Ok(())
    }

    pub async fn lookup_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<(String, Option<String>, Vec<String>, bool, bool, Option<OffsetDateTime>)>> {
        let row = sqlx::query(
            "SELECT role, allowed_source_id, allowed_domains, active, revoked, expires_at \
             FROM api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .context("lookup_api_key failed")?;
        Ok(row.map(|r| {
            (
                r.get::<String, _>("role"),
                r.get::<Option<String>, _>("allowed_source_id"),
                r.get::<Vec<String>, _>("allowed_domains"),
                r.get::<bool, _>("active"),
                r.get::<bool, _>("revoked"),
                r.get::<Option<OffsetDateTime>, _>("expires_at"),
            )
        }))
    }

    pub async fn touch_api_key(&self, key_hash: &str) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE key_hash = $1")
            .bind(key_hash)
            .execute(&self.pool)
            .await
            .context("touch_api_key failed")?;
        Ok(())
    }

    pub async fn create_csv_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("INSERT INTO csv_import_jobs (id, status) VALUES ($1, 'queued')")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("create_csv_job failed")?;
        Ok(())
    }

    pub async fn update_csv_job(
        &self,
        job_id: Uuid,
        status: &str,
        rows_total: Option<i64>,
        rows_accepted: Option<i64>,
        rows_rejected: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE csv_import_jobs SET status = $2, rows_total = $3, rows_accepted = $4, \
             rows_rejected = $5, error = $6 WHERE id = $1",
        )
        .bind(job_id)
        .bind(status)
        .bind(rows_total)
        .bind(rows_accepted)
        .bind(rows_rejected)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("update_csv_job failed")?;
        Ok(())
    }

    pub async fn get_csv_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<(String, Option<i64>, Option<i64>, Option<i64>, Option<String>)>> {
        let row = sqlx::query(
            "SELECT status, rows_total, rows_accepted, rows_rejected, error FROM csv_import_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_csv_job failed")?;
        Ok(row.map(|r| {
            (
                r.get::<String, _>("status"),
                r.get::<Option<i64>, _>("rows_total"),
                r.get::<Option<i64>, _>("rows_accepted"),
                r.get::<Option<i64>, _>("rows_rejected"),
                r.get::<Option<String>, _>("error"),
            )
        }))
    }
}

fn sensor_row_from_row(row: PgRow) -> SensorRow {
    SensorRow {
        id: row.get("id"),
        stream_uuid: row.get("stream_uuid"),
        domain: row.get("domain"),
        source: row.get("source"),
        stream: row.get("stream"),
        legacy_stream_int: row.get("legacy_stream_int"),
        device_uuid: row.get("device_uuid"),
        sensor_type: row.get("sensor_type"),
        operational_state: row.get("operational_state"),
        valid_readings_count: row.get("valid_readings_count"),
        min_readings_for_normal: row.get("min_readings_for_normal"),
    }
}

pub(crate) fn parse_state(s: &str) -> SensorState {
    SensorState::parse(s)
}
