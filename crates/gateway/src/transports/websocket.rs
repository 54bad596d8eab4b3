//! WebSocket transport (spec.md §6 "WebSocket protocol", non-IoT only).
//! The teacher has no streaming-protocol precedent, so this is grounded
//! directly on spec.md's six-step handshake plus axum's `ws` extractor
//! idiom, kept in the same request/response JSON style as
//! `transports::http`.

use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::authenticate_api_key;
use crate::router::{self, InboundReading};
use crate::state::AppState;

const CLIENT_IP_LABEL: &str = "websocket";

/// Server-wide count of data items currently being ingested across all
/// open sessions. A crude but effective backpressure signal: once it
/// crosses `BACKPRESSURE_THRESHOLD` a session is told to slow down
/// instead of piling more work onto an already-saturated pipeline.
static PENDING: AtomicUsize = AtomicUsize::new(0);
const BACKPRESSURE_THRESHOLD: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMsg {
    Connect { source_id: String, domain: String, api_key: String },
    Data { batch: Vec<DataItem> },
    Disconnect,
}

#[derive(Debug, Deserialize)]
struct DataItem {
    stream_id: String,
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
    sequence: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMsg {
    Connected { session_id: Uuid },
    Error { error: String },
    Ack { sequence_up_to: Option<i64>, rejected: Vec<RejectedItem>, processed: usize },
    Backpressure,
}

#[derive(Debug, Serialize)]
struct RejectedItem {
    stream_id: String,
    reason: String,
}

pub async fn handle(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn send(socket: &mut WebSocket, msg: &ServerMsg) -> bool {
    let Ok(text) = serde_json::to_string(msg) else { return false };
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let Some(Ok(Message::Text(first))) = socket.recv().await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (source_id, domain, api_key) = match serde_json::from_str::<ClientMsg>(&first) {
        Ok(ClientMsg::Connect { source_id, domain, api_key }) => (source_id, domain, api_key),
        Ok(_) => {
            send(&mut socket, &ServerMsg::Error { error: "expected connect message first".into() }).await;
            return;
        }
        Err(err) => {
            send(&mut socket, &ServerMsg::Error { error: format!("malformed connect message: {err}") }).await;
            return;
        }
    };

    if domain == "iot" {
        send(&mut socket, &ServerMsg::Error { error: "domain 'iot' must use the device packet endpoint".into() }).await;
        return;
    }

    let key_info = match authenticate_api_key(&state.db, &api_key).await {
        Ok(info) => info,
        Err(err) => {
            send(&mut socket, &ServerMsg::Error { error: err.to_string() }).await;
            return;
        }
    };
    if !key_info.authorize_write(&source_id, &domain) {
        send(&mut socket, &ServerMsg::Error { error: "not authorized for this source/domain".into() }).await;
        return;
    }

    let session_id = Uuid::new_v4();
    if !send(&mut socket, &ServerMsg::Connected { session_id }).await {
        return;
    }
    tracing::info!(%session_id, %domain, source = %source_id, "websocket session connected");

    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMsg>(&text) {
                Ok(ClientMsg::Data { batch }) => {
                    let reply = handle_batch(&state, &domain, &source_id, batch).await;
                    if !send(&mut socket, &reply).await {
                        break;
                    }
                }
                Ok(ClientMsg::Disconnect) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(ClientMsg::Connect { .. }) => {
                    send(&mut socket, &ServerMsg::Error { error: "already connected".into() }).await;
                }
                Err(err) => {
                    send(&mut socket, &ServerMsg::Error { error: format!("malformed message: {err}") }).await;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }

    tracing::info!(%session_id, "websocket session closed");
}

async fn handle_batch(state: &AppState, domain: &str, source_id: &str, batch: Vec<DataItem>) -> ServerMsg {
    if PENDING.load(Ordering::SeqCst) + batch.len() > BACKPRESSURE_THRESHOLD {
        return ServerMsg::Backpressure;
    }

    let batch_len = batch.len();
    PENDING.fetch_add(batch_len, Ordering::SeqCst);
    let mut rejected = Vec::new();
    let mut processed = 0usize;
    let mut sequence_up_to = None;

    for item in batch {
        sequence_up_to = item.sequence.or(sequence_up_to);
        let outcome = router::ingest_by_triple(
            state,
            domain,
            source_id,
            &item.stream_id,
            CLIENT_IP_LABEL,
            None,
            InboundReading {
                value: item.value,
                device_ts: item.timestamp,
                sequence: item.sequence,
                msg_id: None,
            },
        )
        .await;

        match outcome {
            Ok(_) => processed += 1,
            Err(err) => rejected.push(RejectedItem { stream_id: item.stream_id, reason: err.to_string() }),
        }
    }

    PENDING.fetch_sub(batch_len, Ordering::SeqCst);
    ServerMsg::Ack { sequence_up_to, rejected, processed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_message_deserializes() {
        let json = r#"{"type":"connect","source_id":"s1","domain":"weather","api_key":"k"}"#;
        let msg: ClientMsg = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMsg::Connect { .. }));
    }

    #[test]
    fn data_message_deserializes_batch() {
        let json = r#"{"type":"data","batch":[{"stream_id":"temp","value":1.0,"sequence":1}]}"#;
        let msg: ClientMsg = serde_json::from_str(json).unwrap();
        match msg {
            ClientMsg::Data { batch } => assert_eq!(batch.len(), 1),
            _ => panic!("expected data message"),
        }
    }

    #[test]
    fn disconnect_message_deserializes() {
        let json = r#"{"type":"disconnect"}"#;
        assert!(matches!(serde_json::from_str::<ClientMsg>(json).unwrap(), ClientMsg::Disconnect));
    }

    #[test]
    fn connected_message_serializes_with_type_tag() {
        let msg = ServerMsg::Connected { session_id: Uuid::nil() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connected\""));
    }

    #[test]
    fn ack_sequence_up_to_tracks_last_present_sequence() {
        let items = vec![
            DataItem { stream_id: "a".into(), value: 1.0, timestamp: None, sequence: Some(5), metadata: None },
            DataItem { stream_id: "b".into(), value: 2.0, timestamp: None, sequence: None, metadata: None },
        ];
        let mut seq = None;
        for item in &items {
            seq = item.sequence.or(seq);
        }
        assert_eq!(seq, Some(5));
    }
}
