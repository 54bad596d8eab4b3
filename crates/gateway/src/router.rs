//! End-to-end ingestion orchestration (spec.md control-flow diagram):
//! Transport → Decoder → Auth (done by the transport before calling in
//! here) → RateLimiter → Deduplicator → SensorResolver → Classifier →
//! {ALERT, WARNING, PREDICTION} pipeline → on persistence failure →
//! CircuitBreaker + RetryPolicy → DLQ. Grounded on the teacher's
//! `main.rs`/`mqtt.rs` task-wiring style generalized from a single
//! valve-command path to the three classification outcomes.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::SensorRow;
use crate::dedup::{derive_msg_id, DedupOutcome};
use crate::error::{IngestError, IngestResult};
use crate::observation::Classification;
use crate::pipelines::alert::AlertContext;
use crate::pipelines::prediction::PredictionContext;
use crate::pipelines::warning::WarningContext;
use crate::pipelines::{handle_alert, handle_prediction, handle_warning};
use crate::resilience::CallOutcome;
use crate::resilience::DlqEntry;
use crate::state::AppState;

/// A decoded reading, independent of which transport produced it — the
/// identity triple or device/sensor pair is resolved separately so HTTP,
/// MQTT, WebSocket and CSV transports can all funnel into the same
/// orchestration.
#[derive(Debug, Clone)]
pub struct InboundReading {
    pub value: f64,
    pub device_ts: Option<OffsetDateTime>,
    pub sequence: Option<i64>,
    pub msg_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestOutcome {
    pub stream_id: i64,
    pub classification: &'static str,
    pub deduplicated: bool,
}

/// Domain/source/stream addressing (HTTP universal ingest, CSV rows).
pub async fn ingest_by_triple(
    state: &AppState,
    domain: &str,
    source: &str,
    stream: &str,
    client_ip: &str,
    device_uuid: Option<Uuid>,
    reading: InboundReading,
) -> IngestResult<IngestOutcome> {
    let sensor = state.resolver.resolve_by_triple(domain, source, stream).await?;
    ingest(state, sensor, client_ip, device_uuid, reading).await
}

/// Device+sensor UUID addressing (MQTT, device-packet HTTP endpoint).
pub async fn ingest_by_device_and_sensor(
    state: &AppState,
    device_uuid: Uuid,
    sensor_uuid: Uuid,
    client_ip: &str,
    reading: InboundReading,
) -> IngestResult<IngestOutcome> {
    let sensor = state
        .resolver
        .resolve_by_device_and_sensor(device_uuid, sensor_uuid)
        .await?;
    ingest(state, sensor, client_ip, Some(device_uuid), reading).await
}

/// Shared tail of both resolution paths above; also used directly by
/// `transports::http` for the raw-internal-id `/ingest/readings` endpoint,
/// which already knows its `SensorRow` and has no triple/uuid to resolve.
pub(crate) async fn ingest(
    state: &AppState,
    sensor: SensorRow,
    client_ip: &str,
    device_uuid: Option<Uuid>,
    reading: InboundReading,
) -> IngestResult<IngestOutcome> {
    let ingest_ts = OffsetDateTime::now_utc();

    let device_key = device_uuid.map(|u| u.to_string());
    let sensor_key = sensor.id.to_string();
    let decision = state
        .rate_limiter
        .check_all(client_ip, device_key.as_deref(), Some(&sensor_key));
    if !decision.allowed {
        return Err(IngestError::RateLimited {
            scope: decision.scope,
            approx_count: decision.approx_count,
            limit: decision.limit,
        });
    }

    let msg_id = reading.msg_id.clone().unwrap_or_else(|| {
        derive_msg_id(sensor.id, reading.device_ts.unwrap_or(ingest_ts), reading.value)
    });
    if state.dedup.check_and_record(&msg_id).await == DedupOutcome::Duplicate {
        return Ok(IngestOutcome {
            stream_id: sensor.id,
            classification: "DUPLICATE",
            deduplicated: true,
        });
    }

    state.metrics.record(
        sensor.id,
        reading.device_ts.map(|t| t.unix_timestamp() as f64),
        ingest_ts.unix_timestamp() as f64,
        reading.sequence,
    );

    let classification = state
        .classifier
        .classify(sensor.id, reading.value, reading.device_ts, ingest_ts)
        .await
        .map_err(IngestError::Internal)?;

    let label = classification.label();

    if let Err(err) = persist(state, &sensor, device_uuid, &classification, reading.value, ingest_ts, reading.device_ts).await {
        let entry = DlqEntry::new(
            serde_json::json!({
                "stream_id": sensor.id,
                "value": reading.value,
                "ingest_ts": ingest_ts,
                "classification": label,
            })
            .to_string(),
            err.to_string(),
            "persist_error",
            "ingest_pipeline",
        );
        if let Err(dlq_err) = state.dlq.push(&entry).await {
            tracing::error!(error = %dlq_err, stream_id = sensor.id, "failed to dead-letter failed write, data lost");
        }
        return Err(err);
    }

    Ok(IngestOutcome {
        stream_id: sensor.id,
        classification: label,
        deduplicated: false,
    })
}

/// Routes a classification to its sub-pipeline, wrapping the write in the
/// DB circuit breaker and retry-with-backoff (spec.md §4.12-4.13).
async fn persist(
    state: &AppState,
    sensor: &SensorRow,
    device_uuid: Option<Uuid>,
    classification: &Classification,
    value: f64,
    ingest_ts: OffsetDateTime,
    device_ts: Option<OffsetDateTime>,
) -> IngestResult<()> {
    match classification {
        Classification::Alert { threshold_id, .. } => {
            let ctx = AlertContext {
                db: state.db.clone(),
                state_manager: state.state_manager.clone(),
                notifier_url: state.config.backend_url.clone(),
                http: state.http.clone(),
            };
            guarded(state, || handle_alert(&ctx, sensor.id, device_uuid, *threshold_id, value, ingest_ts, device_ts))
                .await
                .map(|_| ())
        }
        Classification::Warning { delta, .. } => {
            let ctx = WarningContext {
                db: state.db.clone(),
                state_manager: state.state_manager.clone(),
            };
            guarded(state, || handle_warning(&ctx, sensor.id, device_uuid, value, delta, ingest_ts, device_ts))
                .await
                .map(|_| ())
        }
        Classification::MlPrediction { .. } => {
            let ctx = PredictionContext {
                db: state.db.clone(),
                broker: state.broker.clone(),
            };
            guarded(state, || handle_prediction(&ctx, sensor.id, &sensor.sensor_type, value, ingest_ts))
                .await?;
            // The raw reading still belongs in the append-only history;
            // route it through the buffered high-throughput writer instead
            // of a synchronous insert (spec.md §4.11).
            state.batch_inserter.add((sensor.id, value, ingest_ts, device_ts, None)).await;
            Ok(())
        }
    }
}

/// Runs `f` through the DB circuit breaker; inside it, retries transient
/// failures with backoff. A tripped breaker and an exhausted retry both
/// surface as `IngestError` so the caller's DLQ fallback is uniform.
async fn guarded<F, Fut, T>(state: &AppState, f: F) -> IngestResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = IngestResult<T>>,
{
    let outcome = state
        .db_breaker
        .call(|| state.retry.run(|e: &IngestError| e.is_retryable(), &f))
        .await;

    match outcome {
        Ok(v) => Ok(v),
        Err(CallOutcome::CircuitOpen(remaining)) => Err(IngestError::CircuitOpen {
            name: state.db_breaker.name().to_string(),
            remaining_secs: remaining.as_secs(),
        }),
        Err(CallOutcome::Inner(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_entry_carries_stream_and_reason() {
        let entry = DlqEntry::new(
            serde_json::json!({"stream_id": 1}).to_string(),
            "boom",
            "persist_error",
            "ingest_pipeline",
        );
        assert_eq!(entry.error_type, "persist_error");
        assert!(entry.payload.contains("stream_id"));
    }
}
