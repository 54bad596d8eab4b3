//! ALERT sub-pipeline (spec.md §4.7).

use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::state_manager::SensorStateManager;
use crate::db::Db;
use crate::error::IngestResult;
use crate::observation::SensorState;

const NOTIFICATION_SOURCE: &str = "alert";

pub struct AlertContext {
    pub db: Arc<Db>,
    pub state_manager: Arc<SensorStateManager>,
    pub notifier_url: Option<String>,
    pub http: reqwest::Client,
}

pub struct AlertOutcome {
    pub alert_id: i64,
    pub notified: bool,
}

/// Persists the reading, upserts the single active alert row, transitions
/// state, and best-effort notifies. Notification/push failures never fail
/// the alert persistence itself.
pub async fn handle_alert(
    ctx: &AlertContext,
    stream_id: i64,
    device_id: Option<Uuid>,
    threshold_id: Option<i64>,
    value: f64,
    ingest_ts: OffsetDateTime,
    device_ts: Option<OffsetDateTime>,
) -> IngestResult<AlertOutcome> {
    ctx.db
        .insert_reading(stream_id, value, ingest_ts, device_ts, None)
        .await
        .map_err(crate::error::IngestError::Internal)?;

    let alert_id = ctx
        .db
        .upsert_active_alert(stream_id, device_id, threshold_id, value, ingest_ts)
        .await
        .map_err(crate::error::IngestError::Internal)?;

    // Idempotent against concurrent observers racing the same transition.
    ctx.state_manager.transition_to(stream_id, SensorState::Alert).await?;

    let notified = notify(ctx, stream_id, alert_id, value).await;

    Ok(AlertOutcome { alert_id, notified })
}

async fn notify(ctx: &AlertContext, stream_id: i64, alert_id: i64, value: f64) -> bool {
    let already_notified = ctx
        .db
        .has_recent_notification(NOTIFICATION_SOURCE, alert_id)
        .await
        .unwrap_or(true); // assume a dup on lookup failure, stay silent rather than spam
    if already_notified {
        return false;
    }

    let title = format!("ALERT on stream {stream_id}");
    let message = format!("value {value} breached configured physical range");
    if let Err(err) = ctx
        .db
        .insert_notification(NOTIFICATION_SOURCE, alert_id, "critical", &title, &message)
        .await
    {
        tracing::warn!(error = %err, stream_id, "failed to record alert notification");
        return false;
    }

    if let Some(url) = &ctx.notifier_url {
        let payload = serde_json::json!({
            "stream_id": stream_id,
            "alert_id": alert_id,
            "value": value,
            "severity": "critical",
        });
        let client = ctx.http.clone();
        let url = url.clone();
        // Fire-and-forget: a failed push must never fail alert persistence.
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).json(&payload).send().await {
                tracing::warn!(error = %err, url, "alert push notification failed");
            }
        });
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_title_and_message_mention_stream_and_value() {
        let title = format!("ALERT on stream {}", 42);
        assert!(title.contains("42"));
    }
}
