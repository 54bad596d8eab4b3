//! Deduplicator: `Deduplicator` trait plus in-memory and Redis
//! implementations (spec.md §4.4, §9 "abstract broker & dedup"). Grounded
//! on `original_source/ingest_api/pipelines/resilience/deduplication.py`.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Atomic "set-if-absent". First call for a `msg_id` within the TTL
    /// returns `New`; subsequent calls return `Duplicate`.
    async fn check_and_record(&self, msg_id: &str) -> DedupOutcome;
}

/// `sensor_id:timestamp(6dp):value(6dp)` — used when the payload doesn't
/// carry an explicit `msg_id` (spec.md §4.4).
pub fn derive_msg_id(sensor_id: i64, timestamp: OffsetDateTime, value: f64) -> String {
    format!(
        "{sensor_id}:{:.6}:{:.6}",
        timestamp.unix_timestamp_nanos() as f64 / 1e9,
        value
    )
}

pub struct InMemoryDeduplicator {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn gc(&self) {
        let now = Instant::now();
        self.entries.lock().unwrap().retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
    }
}

#[async_trait]
impl Deduplicator for InMemoryDeduplicator {
    async fn check_and_record(&self, msg_id: &str) -> DedupOutcome {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(inserted) = entries.get(msg_id) {
            if now.duration_since(*inserted) < self.ttl {
                return DedupOutcome::Duplicate;
            }
        }
        entries.insert(msg_id.to_string(), now);
        DedupOutcome::New
    }
}

pub struct RedisDeduplicator {
    client: Arc<redis::Client>,
    ttl_secs: u64,
}

impl RedisDeduplicator {
    pub fn new(client: Arc<redis::Client>, ttl_secs: u64) -> Self {
        Self { client, ttl_secs }
    }
}

#[async_trait]
impl Deduplicator for RedisDeduplicator {
    async fn check_and_record(&self, msg_id: &str) -> DedupOutcome {
        let key = format!("dedup:{msg_id}");
        let result: Result<bool, redis::RedisError> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let set: bool = conn.set_nx(&key, 1).await?;
            if set {
                let _: () = conn.expire(&key, self.ttl_secs as i64).await?;
            }
            Ok(set)
        }
        .await;

        match result {
            Ok(true) => DedupOutcome::New,
            Ok(false) => DedupOutcome::Duplicate,
            Err(err) => {
                // Fail open: correctness of ingestion beats correctness of
                // dedup (spec.md §4.4).
                tracing::warn!(error = %err, "dedup backing store unreachable, failing open");
                DedupOutcome::New
            }
        }
    }
}

#[derive(Default)]
pub struct DedupCounters {
    checked: std::sync::atomic::AtomicU64,
    duplicates_found: std::sync::atomic::AtomicU64,
}

impl DedupCounters {
    pub fn record(&self, outcome: DedupOutcome) {
        self.checked.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if outcome == DedupOutcome::Duplicate {
            self.duplicates_found.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.checked.load(std::sync::atomic::Ordering::Relaxed),
            self.duplicates_found.load(std::sync::atomic::Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_is_new_second_is_duplicate() {
        let dedup = InMemoryDeduplicator::new(Duration::from_secs(60));
        assert_eq!(dedup.check_and_record("a").await, DedupOutcome::New);
        assert_eq!(dedup.check_and_record("a").await, DedupOutcome::Duplicate);
        assert_eq!(dedup.check_and_record("b").await, DedupOutcome::New);
    }

    #[tokio::test]
    async fn ttl_expiry_allows_reuse() {
        let dedup = InMemoryDeduplicator::new(Duration::from_millis(10));
        assert_eq!(dedup.check_and_record("a").await, DedupOutcome::New);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dedup.check_and_record("a").await, DedupOutcome::New);
    }

    #[test]
    fn derive_msg_id_is_deterministic_for_same_inputs() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let a = derive_msg_id(42, ts, 12.345678);
        let b = derive_msg_id(42, ts, 12.345678);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn counters_track_checked_and_duplicates() {
        let dedup = InMemoryDeduplicator::new(Duration::from_secs(60));
        let counters = DedupCounters::default();
        counters.record(dedup.check_and_record("a").await);
        counters.record(dedup.check_and_record("a").await);
        assert_eq!(counters.snapshot(), (2, 1));
    }
}
