//! PREDICTION sub-pipeline (spec.md §4.9).

use std::sync::Arc;
use time::OffsetDateTime;

use crate::broker::{Reading, ReadingBroker};
use crate::db::Db;
use crate::error::IngestResult;

pub struct PredictionContext {
    pub db: Arc<Db>,
    pub broker: Arc<dyn ReadingBroker>,
}

/// String-round-trip comparison at fixed precision: avoids the
/// float-equality artifacts of comparing `f64`s directly (spec.md §4.9).
fn decimal_eq(a: f64, b: f64) -> bool {
    format!("{a:.9}") == format!("{b:.9}")
}

pub async fn handle_prediction(
    ctx: &PredictionContext,
    stream_id: i64,
    sensor_type: &str,
    value: f64,
    timestamp: OffsetDateTime,
) -> IngestResult<bool> {
    let latest = ctx.db.get_latest_value(stream_id).await.map_err(crate::error::IngestError::Internal)?;

    if let Some(prev) = latest {
        if decimal_eq(prev, value) {
            return Ok(false);
        }
    }

    ctx.db
        .upsert_latest(stream_id, value, timestamp)
        .await
        .map_err(crate::error::IngestError::Internal)?;

    ctx.broker
        .publish(Reading {
            sensor_id: stream_id,
            sensor_type: sensor_type.to_string(),
            value,
            timestamp,
        })
        .await;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_eq_ignores_float_noise_beyond_precision() {
        assert!(decimal_eq(1.0, 1.0 + 1e-12));
        assert!(!decimal_eq(1.0, 1.1));
    }
}
