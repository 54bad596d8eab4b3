//! HTTP transport (spec.md §6 endpoint table). Grounded on the teacher's
//! `web.rs` router/test style, generalized from a two-route dashboard
//! surface to the full JSON ingestion API.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{authenticate_api_key, authenticate_device_key};
use crate::error::{IngestError, IngestResult};
use crate::rate_limiter::client_ip;
use crate::router::{self, InboundReading};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/ingest/readings", post(ingest_reading))
        .route("/ingest/readings/bulk", post(ingest_readings_bulk))
        .route("/ingest/packets", post(ingest_packet))
        .route("/ingest/data", post(ingest_universal))
        .route("/sensors/{id}/status", get(sensor_status))
        .route("/api/ingestion/diagnostics", get(diagnostics));

    #[cfg(feature = "csv-import")]
    {
        app = app
            .route("/ingest/csv", post(super::csv::upload))
            .route("/ingest/csv/jobs/{id}", get(super::csv::job_status));
    }

    #[cfg(feature = "websocket")]
    {
        app = app.route("/ws", get(super::websocket::handle));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&state.config.http_bind).await?;
    tracing::info!(addr = %state.config.http_bind, "http transport listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))),
        Err(err) => {
            tracing::error!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "not_ready"})),
            )
        }
    }
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

fn device_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-device-key").and_then(|v| v.to_str().ok())
}

// --------------------------------------------------------------------
// /ingest/readings, /ingest/readings/bulk
// --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReadingRequest {
    sensor_id: i64,
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct BulkReadingRequest {
    readings: Vec<ReadingRequest>,
}

async fn ingest_reading(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ReadingRequest>,
) -> IngestResult<impl IntoResponse> {
    authenticate_api_key(&state.db, require_api_key(&headers)?).await?;
    let ip = client_ip(&headers, addr.ip());
    let outcome = ingest_one(&state, &ip, body).await?;
    Ok(Json(serde_json::json!({"inserted": !outcome.deduplicated, "classification": outcome.classification})))
}

async fn ingest_readings_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<BulkReadingRequest>,
) -> IngestResult<impl IntoResponse> {
    authenticate_api_key(&state.db, require_api_key(&headers)?).await?;
    let ip = client_ip(&headers, addr.ip());
    let mut inserted = 0u32;
    for reading in body.readings {
        if ingest_one(&state, &ip, reading).await.is_ok() {
            inserted += 1;
        }
    }
    Ok(Json(serde_json::json!({"inserted": inserted})))
}

async fn ingest_one(state: &AppState, ip: &str, req: ReadingRequest) -> IngestResult<router::IngestOutcome> {
    let sensor = state
        .db
        .find_sensor_by_id(req.sensor_id)
        .await
        .map_err(IngestError::Internal)?
        .ok_or(IngestError::UnknownSensor)?;
    router::ingest(
        state,
        sensor,
        ip,
        None,
        InboundReading { value: req.value, device_ts: req.timestamp, sequence: None, msg_id: None },
    )
    .await
}

fn require_api_key(headers: &HeaderMap) -> IngestResult<&str> {
    api_key_header(headers).ok_or(IngestError::Unauthenticated)
}

// --------------------------------------------------------------------
// /ingest/packets
// --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PacketRequest {
    device_uuid: Uuid,
    #[serde(default, with = "time::serde::rfc3339::option")]
    ts: Option<OffsetDateTime>,
    readings: Vec<PacketReading>,
}

#[derive(Debug, Deserialize)]
struct PacketReading {
    sensor_uuid: Uuid,
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    sensor_ts: Option<OffsetDateTime>,
    sequence: Option<i64>,
}

async fn ingest_packet(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<PacketRequest>,
) -> IngestResult<impl IntoResponse> {
    if let Some(key) = device_key_header(&headers) {
        authenticate_device_key(&state.db, key, body.device_uuid).await?;
    } else if let Some(key) = api_key_header(&headers) {
        authenticate_api_key(&state.db, key).await?;
    } else {
        return Err(IngestError::Unauthenticated);
    }

    let ip = client_ip(&headers, addr.ip());
    let ingested_ts = OffsetDateTime::now_utc();
    let mut inserted = 0u32;
    let mut unknown_sensors = Vec::new();

    for reading in body.readings {
        let device_ts = reading.sensor_ts.or(body.ts);
        match router::ingest_by_device_and_sensor(
            &state,
            body.device_uuid,
            reading.sensor_uuid,
            &ip,
            InboundReading { value: reading.value, device_ts, sequence: reading.sequence, msg_id: None },
        )
        .await
        {
            Ok(_) => inserted += 1,
            Err(IngestError::UnknownSensor) => unknown_sensors.push(reading.sensor_uuid),
            Err(err) => return Err(err),
        }
    }

    Ok(Json(serde_json::json!({
        "inserted": inserted,
        "unknown_sensors": unknown_sensors,
        "ingested_ts": ingested_ts,
    })))
}

// --------------------------------------------------------------------
// /ingest/data (universal)
// --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UniversalRequest {
    domain: String,
    source_id: String,
    data_points: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
struct DataPoint {
    stream_id: String,
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    sequence: Option<i64>,
}

async fn ingest_universal(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<UniversalRequest>,
) -> IngestResult<impl IntoResponse> {
    if body.domain == "iot" {
        return Err(IngestError::IotOnPacketEndpointOnly(body.domain));
    }
    let key_info = authenticate_api_key(&state.db, require_api_key(&headers)?).await?;
    if !key_info.authorize_write(&body.source_id, &body.domain) {
        return Err(IngestError::Forbidden);
    }

    let ip = client_ip(&headers, addr.ip());
    let mut accepted = 0u32;
    let mut rejected = 0u32;
    let mut classifications: HashMap<String, &'static str> = HashMap::new();

    for point in body.data_points {
        match router::ingest_by_triple(
            &state,
            &body.domain,
            &body.source_id,
            &point.stream_id,
            &ip,
            None,
            InboundReading { value: point.value, device_ts: point.timestamp, sequence: point.sequence, msg_id: None },
        )
        .await
        {
            Ok(outcome) => {
                accepted += 1;
                classifications.insert(point.stream_id, outcome.classification);
            }
            Err(_) => rejected += 1,
        }
    }

    Ok(Json(serde_json::json!({
        "accepted": accepted,
        "rejected": rejected,
        "classifications": classifications,
    })))
}

// --------------------------------------------------------------------
// /sensors/{id}/status, /api/ingestion/diagnostics
// --------------------------------------------------------------------

async fn sensor_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> IngestResult<impl IntoResponse> {
    authenticate_api_key(&state.db, require_api_key(&headers)?).await?;
    let sensor = state.db.find_sensor_by_id(id).await.map_err(IngestError::Internal)?.ok_or(IngestError::UnknownSensor)?;
    let report = state.metrics.stream_report(id);
    Ok(Json(serde_json::json!({
        "id": sensor.id,
        "domain": sensor.domain,
        "source": sensor.source,
        "stream": sensor.stream,
        "operational_state": sensor.operational_state,
        "metrics": report,
    })))
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    sensor_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct DiagnosticsResponse {
    health: crate::metrics::Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<crate::metrics::StreamReport>,
}

async fn diagnostics(State(state): State<AppState>, Query(q): Query<DiagnosticsQuery>) -> impl IntoResponse {
    let stream = q.sensor_id.and_then(|id| state.metrics.stream_report(id));
    Json(DiagnosticsResponse { health: state.metrics.health(), stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = Router::new().route("/health", get(health));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn require_api_key_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(matches!(require_api_key(&headers), Err(IngestError::Unauthenticated)));
    }
}
