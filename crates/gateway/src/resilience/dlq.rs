//! Dead-letter queue: a bounded append-only Redis stream plus a consumer
//! loop, with a separate archive stream after max retries (spec.md §4.14,
//! recovered feature SPEC_FULL.md §B.4). Grounded on
//! `original_source/ingest_api/pipelines/resilience/dlq_consumer.py`.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

const MAX_PAYLOAD_BYTES: usize = 5000;
const MAX_ERROR_BYTES: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub payload: String,
    pub error: String,
    pub error_type: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sensor_id: Option<i64>,
    pub msg_id: Option<String>,
    pub retry_count: u32,
}

impl DlqEntry {
    pub fn new(payload: impl Into<String>, error: impl Into<String>, error_type: impl Into<String>, source: impl Into<String>) -> Self {
        let mut payload = payload.into();
        payload.truncate(MAX_PAYLOAD_BYTES);
        let mut error = error.into();
        error.truncate(MAX_ERROR_BYTES);
        Self {
            payload,
            error,
            error_type: error_type.into(),
            source: source.into(),
            timestamp: OffsetDateTime::now_utc(),
            sensor_id: None,
            msg_id: None,
            retry_count: 0,
        }
    }
}

pub struct DeadLetterQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    archive_key: String,
    max_len: u64,
    max_retries: u32,
}

impl DeadLetterQueue {
    pub fn new(client: Arc<redis::Client>, max_len: u64, max_retries: u32) -> Self {
        Self {
            client,
            stream_key: "dlq:ingest".to_string(),
            archive_key: "dlq:ingest:archive".to_string(),
            max_len,
            max_retries,
        }
    }

    pub async fn push(&self, entry: &DlqEntry) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let body = serde_json::to_string(entry)?;
        let _: String = conn
            .xadd_maxlen(
                &self.stream_key,
                redis::streams::StreamMaxlen::Approx(self.max_len as usize),
                "*",
                &[("entry", body)],
            )
            .await?;
        Ok(())
    }

    /// Polls up to `batch_size` entries, invokes `handler` for each:
    /// success deletes the stream entry, failure re-queues with
    /// `retry_count + 1`, and exhausting `max_retries` archives it.
    pub async fn poll_and_process<F, Fut>(&self, batch_size: usize, handler: F) -> anyhow::Result<usize>
    where
        F: Fn(DlqEntry) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(
                &[&self.stream_key],
                &["0"],
                &redis::streams::StreamReadOptions::default().count(batch_size),
            )
            .await?;

        let mut processed = 0;
        for stream_key in &reply.keys {
            for stream_id in &stream_key.ids {
                let Some(redis::Value::BulkString(raw)) = stream_id.map.get("entry") else {
                    continue;
                };
                let Ok(raw_str) = std::str::from_utf8(raw) else { continue };
                let Ok(mut entry) = serde_json::from_str::<DlqEntry>(raw_str) else { continue };

                let ok = handler(entry.clone()).await;
                if ok {
                    let _: i64 = conn.xdel(&self.stream_key, &[&stream_id.id]).await?;
                } else {
                    entry.retry_count += 1;
                    let _: i64 = conn.xdel(&self.stream_key, &[&stream_id.id]).await?;
                    if entry.retry_count >= self.max_retries {
                        let body = serde_json::to_string(&entry)?;
                        let _: String = conn.xadd(&self.archive_key, "*", &[("entry", body)]).await?;
                    } else {
                        let body = serde_json::to_string(&entry)?;
                        let _: String = conn
                            .xadd_maxlen(
                                &self.stream_key,
                                redis::streams::StreamMaxlen::Approx(self.max_len as usize),
                                "*",
                                &[("entry", body)],
                            )
                            .await?;
                    }
                }
                processed += 1;
            }
        }
        Ok(processed)
    }

    pub async fn depth(&self) -> anyhow::Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.stream_key).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_truncates_oversized_fields() {
        let entry = DlqEntry::new("x".repeat(6000), "y".repeat(2000), "parse_error", "http");
        assert_eq!(entry.payload.len(), MAX_PAYLOAD_BYTES);
        assert_eq!(entry.error.len(), MAX_ERROR_BYTES);
    }
}
