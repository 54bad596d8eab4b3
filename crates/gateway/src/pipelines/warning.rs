//! WARNING sub-pipeline (spec.md §4.8) — symmetric to ALERT against
//! `ml_events` with `event_code='DELTA_SPIKE'`. Does not forward to the
//! reading broker.

use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::state_manager::SensorStateManager;
use crate::db::Db;
use crate::error::IngestResult;
use crate::observation::{DeltaInfo, SensorState};

pub struct WarningContext {
    pub db: Arc<Db>,
    pub state_manager: Arc<SensorStateManager>,
}

pub async fn handle_warning(
    ctx: &WarningContext,
    stream_id: i64,
    device_id: Option<Uuid>,
    value: f64,
    delta: &DeltaInfo,
    ingest_ts: OffsetDateTime,
    device_ts: Option<OffsetDateTime>,
) -> IngestResult<i64> {
    ctx.db
        .insert_reading(stream_id, value, ingest_ts, device_ts, None)
        .await
        .map_err(crate::error::IngestError::Internal)?;

    let payload = serde_json::json!({
        "delta_abs": delta.delta_abs,
        "delta_rel": delta.delta_rel,
        "slope_abs": delta.slope_abs,
        "slope_rel": delta.slope_rel,
        "last_value": delta.last_value,
        "triggered_thresholds": delta.triggered_thresholds,
        "severity": delta.severity,
    });

    let event_id = ctx
        .db
        .upsert_active_spike_event(stream_id, device_id, payload)
        .await
        .map_err(crate::error::IngestError::Internal)?;

    ctx.state_manager.transition_to(stream_id, SensorState::Warning).await?;

    Ok(event_id)
}
