//! `AppState`: the explicit application context built once at startup and
//! injected into every handler (spec.md §9 "global mutable state" note —
//! replaces module-level singletons with one owned, explicitly
//! constructed struct). Grounded on the teacher's `state.rs` `Arc<...>`
//! composite-state pattern, generalized from a single `RwLock<SystemState>`
//! to one `Arc` field per long-lived component.

use std::sync::Arc;

use crate::batch_inserter::BatchInserter;
use crate::broker::ReadingBroker;
use crate::classifier::state_manager::SensorStateManager;
use crate::classifier::Classifier;
use crate::config::AppConfig;
use crate::db::Db;
use crate::dedup::Deduplicator;
use crate::metrics::MetricsRegistry;
use crate::rate_limiter::RateLimiter;
use crate::resilience::{CircuitBreaker, DeadLetterQueue, RetryPolicy};
use crate::sensor_resolver::SensorResolver;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<Db>,
    pub classifier: Arc<Classifier>,
    pub state_manager: Arc<SensorStateManager>,
    pub resolver: Arc<SensorResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub dedup: Arc<dyn Deduplicator>,
    pub broker: Arc<dyn ReadingBroker>,
    pub batch_inserter: Arc<BatchInserter>,
    pub metrics: Arc<MetricsRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub db_breaker: Arc<CircuitBreaker>,
    pub retry: Arc<RetryPolicy>,
    pub http: reqwest::Client,
}
