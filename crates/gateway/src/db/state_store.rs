//! Postgres-backed `SensorStateStore` (see `classifier::state_manager`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use crate::classifier::state_manager::SensorStateStore;
use crate::observation::SensorState;

use super::parse_state;

pub struct PgStateStore {
    pool: Pool<Postgres>,
}

impl PgStateStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SensorStateStore for PgStateStore {
    async fn register_valid_reading(&self, stream_id: i64) -> Result<SensorState> {
        let row = sqlx::query(
            "UPDATE sensors SET valid_readings_count = valid_readings_count + 1 \
             WHERE id = $1 \
             RETURNING operational_state, valid_readings_count, min_readings_for_normal",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await
        .context("register_valid_reading failed")?;

        let state = parse_state(row.get::<String, _>("operational_state").as_str());
        let count: i64 = row.get("valid_readings_count");
        let min_required: i64 = row.get("min_readings_for_normal");

        if state == SensorState::Initializing && count >= min_required {
            let updated = sqlx::query(
                "UPDATE sensors SET operational_state = 'NORMAL', state_changed_at = now() \
                 WHERE id = $1 AND operational_state = 'INITIALIZING'",
            )
            .bind(stream_id)
            .execute(&self.pool)
            .await
            .context("warm-up transition failed")?;
            if updated.rows_affected() > 0 {
                return Ok(SensorState::Normal);
            }
        }
        Ok(state)
    }

    async fn current_state(&self, stream_id: i64) -> Result<SensorState> {
        let row = sqlx::query("SELECT operational_state FROM sensors WHERE id = $1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .context("current_state failed")?;
        Ok(row
            .map(|r| parse_state(r.get::<String, _>("operational_state").as_str()))
            .unwrap_or(SensorState::Unknown))
    }

    async fn try_transition(
        &self,
        stream_id: i64,
        expected: SensorState,
        target: SensorState,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sensors SET operational_state = $3, state_changed_at = now() \
             WHERE id = $1 AND operational_state = $2",
        )
        .bind(stream_id)
        .bind(expected.as_str())
        .bind(target.as_str())
        .execute(&self.pool)
        .await
        .context("try_transition failed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn sync_state_with_events(&self, stream_id: i64) -> Result<SensorState> {
        let has_active_alert: bool = sqlx::query(
            "SELECT 1 FROM alerts WHERE stream_id = $1 AND status = 'active' LIMIT 1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .context("sync_state_with_events alert lookup failed")?
        .is_some();

        let has_active_spike: bool = sqlx::query(
            "SELECT 1 FROM ml_events WHERE stream_id = $1 AND status = 'active' AND event_code = 'DELTA_SPIKE' LIMIT 1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .context("sync_state_with_events spike lookup failed")?
        .is_some();

        let current = self.current_state(stream_id).await?;
        let reconciled = match (has_active_alert, has_active_spike, current) {
            (true, _, state) if state != SensorState::Alert => SensorState::Alert,
            (false, true, state) if state == SensorState::Alert => SensorState::Normal,
            (false, false, SensorState::Alert) | (false, false, SensorState::Warning) => SensorState::Normal,
            (_, _, state) => state,
        };

        if reconciled != current {
            self.try_transition(stream_id, current, reconciled).await?;
        }
        Ok(reconciled)
    }
}
