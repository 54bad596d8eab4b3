//! Transport decoders (spec.md §4.1): HTTP, MQTT, WebSocket, CSV bulk
//! import. All three network transports converge on `router::ingest*`;
//! CSV converges on the same router through its own per-row driver.

#[cfg(feature = "csv-import")]
pub mod csv;
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "websocket")]
pub mod websocket;
