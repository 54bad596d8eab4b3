//! Postgres-backed `ThresholdLoader` (see `classifier::reading_classifier`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use crate::classifier::reading_classifier::ThresholdLoader;
use crate::observation::{DeltaThreshold, PhysicalRange, Severity, ThresholdSet, WarningBand};

pub struct PgThresholdLoader {
    pool: Pool<Postgres>,
}

impl PgThresholdLoader {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ThresholdLoader for PgThresholdLoader {
    async fn load(&self, stream_id: i64) -> Result<(ThresholdSet, String)> {
        let row = sqlx::query(
            "SELECT sensor_type, physical_min, physical_max, warning_min, warning_max, \
             delta_abs, delta_rel, slope_abs, slope_rel, delta_severity, consecutive_required \
             FROM sensors WHERE id = $1",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await
        .context("load thresholds failed")?;

        let physical_min: Option<f64> = row.get("physical_min");
        let physical_max: Option<f64> = row.get("physical_max");
        let physical_range = if physical_min.is_some() || physical_max.is_some() {
            Some(PhysicalRange {
                threshold_id: stream_id,
                min: physical_min,
                max: physical_max,
            })
        } else {
            None
        };

        let warning_min: Option<f64> = row.get("warning_min");
        let warning_max: Option<f64> = row.get("warning_max");
        let warning_band = if warning_min.is_some() || warning_max.is_some() {
            Some(WarningBand { min: warning_min, max: warning_max })
        } else {
            None
        };

        let abs_delta: Option<f64> = row.get("delta_abs");
        let rel_delta: Option<f64> = row.get("delta_rel");
        let abs_slope: Option<f64> = row.get("slope_abs");
        let rel_slope: Option<f64> = row.get("slope_rel");
        let delta = if abs_delta.is_some() || rel_delta.is_some() || abs_slope.is_some() || rel_slope.is_some() {
            let severity_str: String = row.get("delta_severity");
            Some(DeltaThreshold {
                abs_delta,
                rel_delta,
                abs_slope,
                rel_slope,
                severity: if severity_str == "critical" { Severity::Critical } else { Severity::Warning },
            })
        } else {
            None
        };

        let consecutive_readings_required: i32 = row.get("consecutive_required");
        let sensor_type: String = row.get("sensor_type");

        Ok((
            ThresholdSet {
                physical_range,
                warning_band,
                delta,
                consecutive_readings_required: consecutive_readings_required as u32,
            },
            sensor_type,
        ))
    }
}
