//! Reading broker: publish/subscribe interface for the downstream
//! prediction service, with a per-key throttled wrapper (spec.md §4.10).
//! Grounded on `original_source/ingest_api/broker/throttled.py`; the Rust
//! trait-object shape follows the teacher's `Arc<dyn ...>` wiring.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub sensor_id: i64,
    pub sensor_type: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub type Handler = Arc<dyn Fn(Reading) + Send + Sync>;

#[async_trait]
pub trait ReadingBroker: Send + Sync {
    async fn publish(&self, reading: Reading);
    fn subscribe(&self, handler: Handler);
}

/// No-op default (spec.md §4.10).
#[derive(Default)]
pub struct NullBroker;

#[async_trait]
impl ReadingBroker for NullBroker {
    async fn publish(&self, _reading: Reading) {}
    fn subscribe(&self, _handler: Handler) {}
}

/// Simple in-memory fan-out broker: publishes invoke every subscribed
/// handler synchronously. Adequate for tests and single-process
/// deployments; a Redis-stream-backed implementation would satisfy the
/// same trait for multi-process fan-out.
pub struct InMemoryBroker {
    handlers: Mutex<Vec<Handler>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self { handlers: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ReadingBroker for InMemoryBroker {
    async fn publish(&self, reading: Reading) {
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(reading.clone());
        }
    }

    fn subscribe(&self, handler: Handler) {
        self.handlers.lock().unwrap().push(handler);
    }
}

/// Wraps any `ReadingBroker` and drops publishes for a key younger than
/// `min_interval` (default 1.0s, spec.md §4.10).
pub struct ThrottledReadingBroker {
    inner: Arc<dyn ReadingBroker>,
    min_interval_secs: f64,
    last_publish: Mutex<HashMap<i64, OffsetDateTime>>,
}

impl ThrottledReadingBroker {
    pub fn new(inner: Arc<dyn ReadingBroker>, min_interval_secs: f64) -> Self {
        Self { inner, min_interval_secs, last_publish: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl ReadingBroker for ThrottledReadingBroker {
    async fn publish(&self, reading: Reading) {
        {
            let mut last = self.last_publish.lock().unwrap();
            if let Some(prev) = last.get(&reading.sensor_id) {
                let elapsed = (reading.timestamp - *prev).as_seconds_f64();
                if elapsed < self.min_interval_secs {
                    return; // silently dropped
                }
            }
            last.insert(reading.sensor_id, reading.timestamp);
        }
        self.inner.publish(reading).await;
    }

    fn subscribe(&self, handler: Handler) {
        self.inner.subscribe(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reading_at(sensor_id: i64, secs_from_epoch: i64) -> Reading {
        Reading {
            sensor_id,
            sensor_type: "temperature".to_string(),
            value: 1.0,
            timestamp: OffsetDateTime::from_unix_timestamp(secs_from_epoch).unwrap(),
        }
    }

    #[tokio::test]
    async fn throttled_broker_drops_rapid_republish() {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(InMemoryBroker::default());
        let c = counter.clone();
        inner.subscribe(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let throttled = ThrottledReadingBroker::new(inner, 1.0);

        throttled.publish(reading_at(1, 1000)).await;
        throttled.publish(reading_at(1, 1000)).await; // same ts, dropped
        throttled.publish(reading_at(1, 1002)).await; // 2s later, allowed

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn throttle_is_per_sensor() {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(InMemoryBroker::default());
        let c = counter.clone();
        inner.subscribe(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let throttled = ThrottledReadingBroker::new(inner, 1.0);

        throttled.publish(reading_at(1, 1000)).await;
        throttled.publish(reading_at(2, 1000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
