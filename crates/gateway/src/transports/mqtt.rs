//! MQTT transport (spec.md §4.1, §6 "MQTT topics"). Subscribes to the
//! legacy `iot/sensors/+/readings` topic always, and the universal
//! `+/+/+/data` topic when feature-flagged. Grounded on the teacher's
//! `main.rs` `AsyncClient`/`EventLoop` wiring and `mqtt.rs` topic-parsing
//! style, generalized from valve-command topics to reading topics.
//!
//! The on-message path only parses the topic/payload and enqueues onto a
//! bounded channel; a separate worker task drains the channel and drives
//! the ingestion pipeline, so a slow DB write never stalls the eventloop
//! (spec.md §5: "the MQTT on-message callback must enqueue into an async
//! processor rather than call the pipeline directly").

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::router::{self, InboundReading};
use crate::state::AppState;

const LEGACY_TOPIC_FILTER: &str = "iot/sensors/+/readings";
const UNIVERSAL_TOPIC_FILTER: &str = "+/+/+/data";
const CLIENT_IP_LABEL: &str = "mqtt";

/// Depth of the decode→ingest queue between the eventloop task and the
/// worker task. Sized generously; spec.md's own backpressure story lives
/// at the WebSocket layer, not here — an MQTT broker already buffers.
const JOB_QUEUE_DEPTH: usize = 2048;

#[derive(Debug)]
enum MqttJob {
    Legacy { legacy_id: i64, payload: LegacyEnvelope },
    Universal { domain: String, source: String, stream: String, payload: UniversalPayload },
}

#[derive(Debug, Deserialize)]
struct LegacyEnvelope {
    #[allow(dead_code)]
    v: u32,
    #[serde(rename = "sensorId")]
    sensor_id: String,
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<time::OffsetDateTime>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UniversalPayload {
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<time::OffsetDateTime>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    sequence: Option<i64>,
}

/// Extracts the legacy numeric id from `iot/sensors/{id}/readings`.
fn parse_legacy_topic(topic: &str) -> Option<i64> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[0] == "iot" && parts[1] == "sensors" && parts[3] == "readings" {
        parts[2].parse().ok()
    } else {
        None
    }
}

/// Extracts `(domain, source, stream)` from `{domain}/{source}/{stream}/data`.
/// The `iot` domain is rejected here — it must arrive on the legacy topic.
fn parse_universal_topic(topic: &str) -> Option<(&str, &str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[3] == "data" && parts[0] != "iot" {
        Some((parts[0], parts[1], parts[2]))
    } else {
        None
    }
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let cfg = &state.config.mqtt;
    let mut mqttoptions = MqttOptions::new("ingestion-gateway", &cfg.broker_host, cfg.broker_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_clean_session(false);

    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        mqttoptions.set_credentials(user, pass);
        info!("mqtt: using password authentication");
    } else {
        warn!("MQTT_USERNAME / MQTT_PASSWORD not set — connecting without authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
    client.subscribe(LEGACY_TOPIC_FILTER, QoS::AtLeastOnce).await?;
    if state.config.features.mqtt_universal {
        client.subscribe(UNIVERSAL_TOPIC_FILTER, QoS::AtLeastOnce).await?;
        info!(topic = UNIVERSAL_TOPIC_FILTER, "mqtt: universal topic enabled");
    }

    let (tx, mut rx) = mpsc::channel::<MqttJob>(JOB_QUEUE_DEPTH);

    let worker_state = state.clone();
    let worker = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            process_job(&worker_state, job).await;
        }
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();
                if let Some(legacy_id) = parse_legacy_topic(&topic) {
                    match serde_json::from_slice::<LegacyEnvelope>(&p.payload) {
                        Ok(payload) => enqueue(&tx, MqttJob::Legacy { legacy_id, payload }).await,
                        Err(err) => warn!(topic = %topic, error = %err, "malformed legacy mqtt payload"),
                    }
                } else if let Some((domain, source, stream)) = parse_universal_topic(&topic) {
                    match serde_json::from_slice::<UniversalPayload>(&p.payload) {
                        Ok(payload) => {
                            enqueue(
                                &tx,
                                MqttJob::Universal {
                                    domain: domain.to_string(),
                                    source: source.to_string(),
                                    stream: stream.to_string(),
                                    payload,
                                },
                            )
                            .await
                        }
                        Err(err) => warn!(topic = %topic, error = %err, "malformed universal mqtt payload"),
                    }
                } else {
                    warn!(topic = %topic, "mqtt: unrecognized topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(err) = client.subscribe(LEGACY_TOPIC_FILTER, QoS::AtLeastOnce).await {
                    error!(error = %err, "mqtt: re-subscribe to legacy topic failed");
                }
                if state.config.features.mqtt_universal {
                    if let Err(err) = client.subscribe(UNIVERSAL_TOPIC_FILTER, QoS::AtLeastOnce).await {
                        error!(error = %err, "mqtt: re-subscribe to universal topic failed");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt eventloop error, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        if worker.is_finished() {
            error!("mqtt ingest worker task exited unexpectedly");
            break;
        }
    }

    Ok(())
}

async fn enqueue(tx: &mpsc::Sender<MqttJob>, job: MqttJob) {
    if tx.try_send(job).is_err() {
        warn!("mqtt ingest queue full — dropping reading");
    }
}

async fn process_job(state: &AppState, job: MqttJob) {
    let outcome = match job {
        MqttJob::Legacy { legacy_id, payload } => {
            process_legacy(state, legacy_id, payload).await
        }
        MqttJob::Universal { domain, source, stream, payload } => {
            router::ingest_by_triple(
                state,
                &domain,
                &source,
                &stream,
                CLIENT_IP_LABEL,
                None,
                InboundReading {
                    value: payload.value,
                    device_ts: payload.timestamp,
                    sequence: payload.sequence,
                    msg_id: None,
                },
            )
            .await
        }
    };

    if let Err(err) = outcome {
        warn!(error = %err, "mqtt reading rejected");
    }
}

async fn process_legacy(
    state: &AppState,
    legacy_id: i64,
    payload: LegacyEnvelope,
) -> crate::error::IngestResult<router::IngestOutcome> {
    if payload.sensor_id.parse::<i64>() != Ok(legacy_id) {
        warn!(
            topic_id = legacy_id,
            payload_id = %payload.sensor_id,
            "mqtt: legacy topic id and payload sensorId disagree, trusting topic"
        );
    }

    let sensor = state
        .db
        .find_sensor_by_legacy_id(legacy_id)
        .await
        .map_err(crate::error::IngestError::Internal)?
        .ok_or(crate::error::IngestError::UnknownSensor)?;

    router::ingest(
        state,
        sensor,
        CLIENT_IP_LABEL,
        None::<Uuid>,
        InboundReading {
            value: payload.value,
            device_ts: payload.timestamp,
            sequence: None,
            msg_id: None,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_legacy_topic_extracts_id() {
        assert_eq!(parse_legacy_topic("iot/sensors/42/readings"), Some(42));
    }

    #[test]
    fn parse_legacy_topic_rejects_non_numeric_id() {
        assert_eq!(parse_legacy_topic("iot/sensors/abc/readings"), None);
    }

    #[test]
    fn parse_legacy_topic_rejects_wrong_shape() {
        assert_eq!(parse_legacy_topic("iot/sensors/42/status"), None);
        assert_eq!(parse_legacy_topic("iot/42/readings"), None);
    }

    #[test]
    fn parse_universal_topic_extracts_triple() {
        assert_eq!(
            parse_universal_topic("acme/greenhouse-1/temp/data"),
            Some(("acme", "greenhouse-1", "temp"))
        );
    }

    #[test]
    fn parse_universal_topic_rejects_iot_domain() {
        assert_eq!(parse_universal_topic("iot/a/b/data"), None);
    }

    #[test]
    fn parse_universal_topic_rejects_wrong_suffix() {
        assert_eq!(parse_universal_topic("a/b/c/status"), None);
    }

    #[test]
    fn legacy_envelope_deserializes_camel_case_sensor_id() {
        let json = r#"{"v":1,"sensorId":"42","value":21.5,"metadata":{}}"#;
        let env: LegacyEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.sensor_id, "42");
        assert_eq!(env.value, 21.5);
    }

    #[test]
    fn universal_payload_defaults_optional_fields() {
        let json = r#"{"value":3.2}"#;
        let payload: UniversalPayload = serde_json::from_str(json).unwrap();
        assert!(payload.timestamp.is_none());
        assert!(payload.sequence.is_none());
    }
}
