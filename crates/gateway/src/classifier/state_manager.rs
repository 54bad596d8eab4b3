//! Sensor operational-state machine with optimistic-locking transitions.
//! Grounded on `original_source/ingest_api/sensor_state.py`.

use crate::observation::SensorState;
use anyhow::Result;
use async_trait::async_trait;

/// Persistence boundary for the state machine. `db::PgStateStore` is the
/// production implementation; tests use an in-memory one.
#[async_trait]
pub trait SensorStateStore: Send + Sync {
    /// Atomically increments `valid_readings_count`; if it crosses
    /// `min_readings_for_normal` while INITIALIZING, transitions to NORMAL.
    /// Returns the resulting state.
    async fn register_valid_reading(&self, stream_id: i64) -> Result<SensorState>;

    async fn current_state(&self, stream_id: i64) -> Result<SensorState>;

    /// Conditional `UPDATE ... WHERE operational_state = expected`. Returns
    /// `true` iff the row was updated (i.e. `expected` still held).
    async fn try_transition(
        &self,
        stream_id: i64,
        expected: SensorState,
        target: SensorState,
    ) -> Result<bool>;

    /// Reconciles `operational_state` against active `ml_events`/`alerts`
    /// rows (recovered feature, SPEC_FULL.md §B.3).
    async fn sync_state_with_events(&self, stream_id: i64) -> Result<SensorState>;
}

pub struct SensorStateManager {
    store: std::sync::Arc<dyn SensorStateStore>,
}

impl SensorStateManager {
    pub fn new(store: std::sync::Arc<dyn SensorStateStore>) -> Self {
        Self { store }
    }

    pub async fn register_valid_reading(&self, stream_id: i64) -> Result<SensorState> {
        self.store.register_valid_reading(stream_id).await
    }

    pub async fn current_state(&self, stream_id: i64) -> Result<SensorState> {
        self.store.current_state(stream_id).await
    }

    /// Transition with one retry against fresh state on optimistic-lock
    /// mismatch (spec.md §5 ordering guarantees, §7 "retry once on
    /// optimistic-lock mismatch; else log and proceed without event").
    ///
    /// Implements the collapse rule from `sensor_state.py`:
    /// `on_threshold_violated`/`on_value_back_to_normal` — re-entering the
    /// same state is a no-op (not a new transition), and a WARNING attempt
    /// against a stream already in ALERT never downgrades it.
    pub async fn transition_to(&self, stream_id: i64, target: SensorState) -> Result<SensorState> {
        let current = self.store.current_state(stream_id).await?;

        if current == target {
            return Ok(current);
        }

        // ALERT is sticky against a WARNING-severity attempt.
        if current == SensorState::Alert && target == SensorState::Warning {
            return Ok(current);
        }

        if !current.can_transition_to(target) {
            tracing::warn!(stream_id, from = current.as_str(), to = target.as_str(), "rejected invalid state transition");
            return Ok(current);
        }

        if self.store.try_transition(stream_id, current, target).await? {
            return Ok(target);
        }

        // Lost the race: re-read and retry once against fresh state.
        let fresh = self.store.current_state(stream_id).await?;
        if fresh == target || !fresh.can_transition_to(target) {
            return Ok(fresh);
        }
        if self.store.try_transition(stream_id, fresh, target).await? {
            Ok(target)
        } else {
            tracing::warn!(stream_id, "optimistic lock retry exhausted, proceeding without event");
            self.store.current_state(stream_id).await
        }
    }

    pub async fn sync_state_with_events(&self, stream_id: i64) -> Result<SensorState> {
        self.store.sync_state_with_events(stream_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct InMemoryStore {
        states: Mutex<HashMap<i64, SensorState>>,
    }

    #[async_trait]
    impl SensorStateStore for InMemoryStore {
        async fn register_valid_reading(&self, stream_id: i64) -> Result<SensorState> {
            Ok(*self.states.lock().unwrap().get(&stream_id).unwrap_or(&SensorState::Normal))
        }

        async fn current_state(&self, stream_id: i64) -> Result<SensorState> {
            Ok(*self.states.lock().unwrap().get(&stream_id).unwrap_or(&SensorState::Unknown))
        }

        async fn try_transition(
            &self,
            stream_id: i64,
            expected: SensorState,
            target: SensorState,
        ) -> Result<bool> {
            let mut states = self.states.lock().unwrap();
            let cur = *states.get(&stream_id).unwrap_or(&SensorState::Unknown);
            if cur == expected {
                states.insert(stream_id, target);
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn sync_state_with_events(&self, stream_id: i64) -> Result<SensorState> {
            self.current_state(stream_id).await
        }
    }

    #[tokio::test]
    async fn alert_is_sticky_against_warning() {
        let store = std::sync::Arc::new(InMemoryStore {
            states: Mutex::new(HashMap::from([(1, SensorState::Alert)])),
        });
        let mgr = SensorStateManager::new(store);
        let result = mgr.transition_to(1, SensorState::Warning).await.unwrap();
        assert_eq!(result, SensorState::Alert);
    }

    #[tokio::test]
    async fn same_state_is_a_noop() {
        let store = std::sync::Arc::new(InMemoryStore {
            states: Mutex::new(HashMap::from([(1, SensorState::Normal)])),
        });
        let mgr = SensorStateManager::new(store);
        let result = mgr.transition_to(1, SensorState::Normal).await.unwrap();
        assert_eq!(result, SensorState::Normal);
    }

    #[tokio::test]
    async fn valid_transition_succeeds() {
        let store = std::sync::Arc::new(InMemoryStore {
            states: Mutex::new(HashMap::from([(1, SensorState::Normal)])),
        });
        let mgr = SensorStateManager::new(store);
        let result = mgr.transition_to(1, SensorState::Alert).await.unwrap();
        assert_eq!(result, SensorState::Alert);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = std::sync::Arc::new(InMemoryStore {
            states: Mutex::new(HashMap::from([(1, SensorState::Initializing)])),
        });
        let mgr = SensorStateManager::new(store);
        let result = mgr.transition_to(1, SensorState::Alert).await.unwrap();
        assert_eq!(result, SensorState::Initializing);
    }
}
