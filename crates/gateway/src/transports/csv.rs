//! CSV bulk-import transport (spec.md §4.1, §6 `/ingest/csv*`). Grounded on
//! `original_source/ingest_api/transports/csv/processor.py`'s
//! queued→running→completed/failed job model; the multipart upload shape
//! follows axum's extractor idiom (the teacher has no file-upload surface).

use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::authenticate_api_key;
use crate::error::{IngestError, IngestResult};
use crate::router::{self, InboundReading};
use crate::state::AppState;

fn require_api_key(headers: &HeaderMap) -> IngestResult<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok()).ok_or(IngestError::Unauthenticated)
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    stream: String,
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> IngestResult<impl IntoResponse> {
    authenticate_api_key(&state.db, require_api_key(&headers)?).await?;
    if !state.config.features.csv_enabled {
        return Err(IngestError::ServiceUnavailable("csv import disabled"));
    }

    let mut domain = None;
    let mut source = None;
    let mut file_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| IngestError::ParseError(e.to_string()))? {
        match field.name() {
            Some("domain") => domain = Some(field.text().await.map_err(|e| IngestError::ParseError(e.to_string()))?),
            Some("source") => source = Some(field.text().await.map_err(|e| IngestError::ParseError(e.to_string()))?),
            Some("file") => {
                file_bytes = Some(field.bytes().await.map_err(|e| IngestError::ParseError(e.to_string()))?.to_vec());
            }
            _ => {}
        }
    }

    let domain = domain.ok_or_else(|| IngestError::ValidationError("missing 'domain' field".to_string()))?;
    let source = source.ok_or_else(|| IngestError::ValidationError("missing 'source' field".to_string()))?;
    let file_bytes = file_bytes.ok_or_else(|| IngestError::ValidationError("missing 'file' field".to_string()))?;

    let job_id = Uuid::new_v4();
    state.db.create_csv_job(job_id).await.map_err(IngestError::Internal)?;

    let job_state = state.clone();
    tokio::spawn(async move {
        run_job(job_state, job_id, domain, source, file_bytes).await;
    });

    Ok(Json(serde_json::json!({"job_id": job_id, "status": "queued"})))
}

pub async fn job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> IngestResult<impl IntoResponse> {
    authenticate_api_key(&state.db, require_api_key(&headers)?).await?;
    let (status, rows_total, rows_accepted, rows_rejected, error) = state
        .db
        .get_csv_job(id)
        .await
        .map_err(IngestError::Internal)?
        .ok_or(IngestError::NotFound("csv_import_job"))?;

    Ok(Json(serde_json::json!({
        "job_id": id,
        "status": status,
        "rows_total": rows_total,
        "rows_accepted": rows_accepted,
        "rows_rejected": rows_rejected,
        "error": error,
    })))
}

/// Runs off the request task: parses rows, ingests each through the normal
/// pipeline, and records the final tally on the job row.
async fn run_job(state: AppState, job_id: Uuid, domain: String, source: String, data: Vec<u8>) {
    if state.db.update_csv_job(job_id, "running", None, None, None, None).await.is_err() {
        return;
    }

    let mut reader = ::csv::Reader::from_reader(data.as_slice());
    let mut total: i64 = 0;
    let mut accepted: i64 = 0;
    let mut rejected: i64 = 0;

    for result in reader.deserialize::<CsvRow>() {
        total += 1;
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(error = %err, job_id = %job_id, "csv row failed to parse");
                rejected += 1;
                continue;
            }
        };

        let outcome = router::ingest_by_triple(
            &state,
            &domain,
            &source,
            &row.stream,
            "csv-import",
            None,
            InboundReading { value: row.value, device_ts: row.timestamp, sequence: None, msg_id: None },
        )
        .await;

        match outcome {
            Ok(_) => accepted += 1,
            Err(err) => {
                tracing::warn!(error = %err, job_id = %job_id, stream = row.stream, "csv row rejected");
                rejected += 1;
            }
        }
    }

    let final_status = if rejected == total && total > 0 { "failed" } else { "completed" };
    let _ = state
        .db
        .update_csv_job(job_id, final_status, Some(total), Some(accepted), Some(rejected), None)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_row_parses_optional_timestamp() {
        let mut reader = ::csv::Reader::from_reader("stream,value\ntemp,21.5\n".as_bytes());
        let row: CsvRow = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(row.stream, "temp");
        assert_eq!(row.value, 21.5);
        assert!(row.timestamp.is_none());
    }
}
