//! Buffered bulk-write path for high-throughput ingest (spec.md §4.11).
//! Grounded on `original_source/ingest_api/batch_inserter.py`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::db::Db;

pub type ReadingRow = (i64, f64, OffsetDateTime, Option<OffsetDateTime>, Option<i64>);

#[derive(Default)]
pub struct BatchInserterStats {
    pub total_added: AtomicU64,
    pub flushed: AtomicU64,
    pub dropped: AtomicU64,
}

impl BatchInserterStats {
    /// `buffered + flushed + dropped = total_added` (spec.md §8 invariant 9).
    pub fn buffered(&self) -> u64 {
        self.total_added.load(Ordering::Relaxed)
            - self.flushed.load(Ordering::Relaxed)
            - self.dropped.load(Ordering::Relaxed)
    }
}

pub struct BatchInserter {
    db: Arc<Db>,
    buffer: Arc<Mutex<VecDeque<ReadingRow>>>,
    capacity: usize,
    max_batch: usize,
    flush_tick: Duration,
    stats: Arc<BatchInserterStats>,
    flush_signal: mpsc::Sender<()>,
    flush_signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchInserter {
    pub fn new(db: Arc<Db>, capacity: usize, max_batch: usize, flush_tick: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            db,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            max_batch,
            flush_tick,
            stats: Arc::new(BatchInserterStats::default()),
            flush_signal: tx,
            flush_signal_rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<BatchInserterStats> {
        self.stats.clone()
    }

    /// Backpressure: drop and count if the buffer already holds `2x
    /// capacity`; otherwise append, signalling the flusher once capacity
    /// is reached.
    pub async fn add(&self, row: ReadingRow) {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.capacity * 2 {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buffer.push_back(row);
        self.stats.total_added.fetch_add(1, Ordering::Relaxed);
        if buffer.len() >= self.capacity {
            let _ = self.flush_signal.try_send(());
        }
    }

    async fn flush_once(buffer: &Mutex<VecDeque<ReadingRow>>, db: &Db, max_batch: usize, stats: &BatchInserterStats) {
        let taken: Vec<ReadingRow> = {
            let mut buffer = buffer.lock().await;
            let n = max_batch.min(buffer.len());
            buffer.drain(..n).collect()
        };
        if taken.is_empty() {
            return;
        }
        match db.insert_readings_batch(&taken).await {
            Ok(()) => {
                stats.flushed.fetch_add(taken.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!(error = %err, count = taken.len(), "batch insert failed, re-queueing for retry");
                let mut buffer = buffer.lock().await;
                for row in taken.into_iter().rev() {
                    buffer.push_front(row);
                }
            }
        }
    }

    /// Idempotent: calling `start` twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let mut rx = self.flush_signal_rx.lock().await.take().expect("flush_signal_rx already taken");
        let buffer = self.buffer.clone();
        let db = self.db.clone();
        let max_batch = self.max_batch;
        let stats = self.stats.clone();
        let tick = self.flush_tick;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::flush_once(&buffer, &db, max_batch, &stats).await;
                    }
                    signal = rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        Self::flush_once(&buffer, &db, max_batch, &stats).await;
                    }
                }
            }
        });
        *worker = Some(handle);
    }

    /// Idempotent. Flushes the remaining buffer if `flush_remaining` is
    /// true, then stops the background worker.
    pub async fn stop(&self, flush_remaining: bool) {
        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            handle.abort();
        }
        if flush_remaining {
            loop {
                let len = self.buffer.lock().await.len();
                if len == 0 {
                    break;
                }
                Self::flush_once(&self.buffer, &self.db, self.max_batch, &self.stats).await;
            }
        }
    }
}
