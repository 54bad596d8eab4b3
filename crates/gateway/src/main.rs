//! Gateway entry point: reads env/config, connects to Postgres and Redis,
//! wires up the classifier, resilience layer and transports, and runs them
//! to completion.
//!
//! Safety features:
//! - Graceful shutdown: stop accepting new transport connections, flush the
//!   batch inserter, then exit
//! - DB circuit breaker + retry around every persistence call
//! - Dead-letter queue for writes that exhaust retries
//! - MQTT re-subscribe on every reconnect

mod auth;
mod batch_inserter;
mod broker;
mod classifier;
mod config;
mod db;
mod dedup;
mod error;
mod metrics;
mod observation;
mod pipelines;
mod rate_limiter;
mod resilience;
mod router;
mod sensor_resolver;
mod state;
mod transports;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use batch_inserter::BatchInserter;
use broker::{NullBroker, ReadingBroker, ThrottledReadingBroker};
use classifier::{Classifier, SensorStateManager};
use config::AppConfig;
use db::{Db, PgStateStore, PgThresholdLoader};
use dedup::{Deduplicator, InMemoryDeduplicator, RedisDeduplicator};
use metrics::MetricsRegistry;
use rate_limiter::RateLimiter;
use resilience::{CircuitBreaker, DeadLetterQueue, RetryPolicy};
use sensor_resolver::SensorResolver;
use state::AppState;

/// Bounded buffer size for the batch inserter (spec.md §4.11 default).
const BATCH_CAPACITY: usize = 100;
/// Max rows flushed per batch insert (spec.md §4.11 default).
const BATCH_MAX_SIZE: usize = 500;
/// Periodic flush interval when the buffer hasn't filled (spec.md §4.11 default).
const BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// How many DLQ entries the background consumer attempts per poll.
const DLQ_POLL_BATCH: usize = 50;
/// Delay between DLQ consumer polls.
const DLQ_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = AppConfig::from_env();
    let state = build_state(cfg).await?;

    if let Some(path) = state.config.bootstrap_toml_path.clone() {
        match config::load_bootstrap(&path) {
            Ok(bootstrap) => {
                if let Err(err) = config::apply_bootstrap(&bootstrap, &state.db).await {
                    error!(error = %err, "failed to apply bootstrap config");
                }
            }
            Err(err) => warn!(error = %err, path = %path, "bootstrap config not loaded"),
        }
    }

    state.batch_inserter.start().await;

    let http_state = state.clone();
    let http_task = tokio::spawn(async move {
        if let Err(err) = transports::http::serve(http_state).await {
            error!(error = %err, "http transport exited");
        }
    });

    #[cfg(feature = "mqtt")]
    let mqtt_task = {
        let mqtt_state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = transports::mqtt::serve(mqtt_state).await {
                error!(error = %err, "mqtt transport exited");
            }
        })
    };

    let dlq_state = state.clone();
    let dlq_task = tokio::spawn(async move { run_dlq_consumer(dlq_state).await });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    http_task.abort();
    #[cfg(feature = "mqtt")]
    mqtt_task.abort();
    dlq_task.abort();

    state.batch_inserter.stop(true).await;
    // Broker has no close() (NullBroker/ThrottledReadingBroker hold no
    // connection); the sqlx pool closes its connections on drop when the
    // last `Arc<Db>` goes out of scope at the end of `main`.
    info!("shutdown complete");

    Ok(())
}

async fn build_state(cfg: AppConfig) -> Result<AppState> {
    let cfg = Arc::new(cfg);

    let db = Arc::new(Db::connect(&cfg.db).await?);
    db.migrate().await?;

    let redis_client = Arc::new(
        redis::Client::open(cfg.redis_url.clone())
            .with_context(|| format!("invalid redis url: {}", cfg.redis_url))?,
    );

    let state_store = Arc::new(PgStateStore::new(db.pool().clone()));
    let state_manager = Arc::new(SensorStateManager::new(state_store));
    let threshold_loader = Arc::new(PgThresholdLoader::new(db.pool().clone()));
    let classifier = Arc::new(Classifier::new(state_manager.clone(), threshold_loader));

    let resolver = Arc::new(SensorResolver::new(db.clone(), cfg.sensor_map_ttl_secs));
    let rate_limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit.global_per_min,
        cfg.rate_limit.device_per_min,
        cfg.rate_limit.sensor_per_min,
    ));

    let dedup: Arc<dyn Deduplicator> = if cfg.resilience.dedup_enabled {
        Arc::new(RedisDeduplicator::new(redis_client.clone(), cfg.resilience.dedup_ttl_secs))
    } else {
        Arc::new(InMemoryDeduplicator::new(Duration::from_secs(cfg.resilience.dedup_ttl_secs)))
    };

    let broker: Arc<dyn ReadingBroker> = Arc::new(ThrottledReadingBroker::new(
        Arc::new(NullBroker),
        cfg.ml_publish_min_interval_secs,
    ));

    let batch_inserter = Arc::new(BatchInserter::new(
        db.clone(),
        BATCH_CAPACITY,
        BATCH_MAX_SIZE,
        BATCH_FLUSH_INTERVAL,
    ));

    let metrics = Arc::new(MetricsRegistry::new());
    let dlq = Arc::new(DeadLetterQueue::new(
        redis_client.clone(),
        cfg.resilience.dlq_max_len,
        cfg.resilience.dlq_max_retries,
    ));
    let db_breaker = Arc::new(CircuitBreaker::new(
        "db",
        cfg.resilience.cb_failure_threshold,
        cfg.resilience.cb_recovery_timeout,
        cfg.resilience.cb_success_threshold,
    ));
    let retry = Arc::new(RetryPolicy::new(
        cfg.resilience.retry_max_attempts,
        cfg.resilience.retry_base_delay,
        cfg.resilience.retry_max_delay,
    ));

    Ok(AppState {
        config: cfg,
        db,
        classifier,
        state_manager,
        resolver,
        rate_limiter,
        dedup,
        broker,
        batch_inserter,
        metrics,
        dlq,
        db_breaker,
        retry,
        http: reqwest::Client::new(),
    })
}

/// Drains the dead-letter queue in the background, re-attempting the raw
/// insert for entries that failed the synchronous write path (spec.md
/// §4.14). Entries that keep failing are retried with backoff by the queue
/// itself and eventually archived once `max_retries` is exhausted.
async fn run_dlq_consumer(state: AppState) {
    if !state.config.resilience.dlq_enabled {
        return;
    }

    loop {
        let db = state.db.clone();
        let processed = state
            .dlq
            .poll_and_process(DLQ_POLL_BATCH, move |entry| {
                let db = db.clone();
                async move { reprocess_dlq_entry(&db, &entry).await }
            })
            .await;

        match processed {
            Ok(0) => tokio::time::sleep(DLQ_POLL_INTERVAL).await,
            Ok(n) => info!(count = n, "dlq consumer processed entries"),
            Err(err) => {
                warn!(error = %err, "dlq poll failed");
                tokio::time::sleep(DLQ_POLL_INTERVAL).await;
            }
        }
    }
}

async fn reprocess_dlq_entry(db: &Db, entry: &resilience::DlqEntry) -> bool {
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&entry.payload) else {
        return false;
    };
    let (Some(stream_id), Some(value)) = (
        payload.get("stream_id").and_then(|v| v.as_i64()),
        payload.get("value").and_then(|v| v.as_f64()),
    ) else {
        return false;
    };

    db.insert_reading(stream_id, value, time::OffsetDateTime::now_utc(), None, None)
        .await
        .is_ok()
}
