//! Orchestrates the classifier's strict evaluation order (spec.md §4.6).

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{info, warn};

use super::consecutive_tracker::ConsecutiveTracker;
use super::delta_detector;
use super::state_manager::SensorStateManager;
use super::thresholds::ThresholdCache;
use crate::observation::{Classification, LastReading, SensorState, ThresholdSet};

/// Loads a stream's threshold configuration and sensor type on cache miss.
#[async_trait]
pub trait ThresholdLoader: Send + Sync {
    async fn load(&self, stream_id: i64) -> Result<(ThresholdSet, String)>;
}

/// Minimum interval between two WARNING events on the same stream
/// (glossary: "Cooldown").
const WARNING_COOLDOWN_SECS: i64 = 300;

pub struct Classifier {
    state_manager: Arc<SensorStateManager>,
    loader: Arc<dyn ThresholdLoader>,
    threshold_cache: ThresholdCache,
    consecutive: ConsecutiveTracker,
    last_readings: Mutex<HashMap<i64, LastReading>>,
    warning_cooldown: Mutex<HashMap<i64, OffsetDateTime>>,
}

impl Classifier {
    pub fn new(state_manager: Arc<SensorStateManager>, loader: Arc<dyn ThresholdLoader>) -> Self {
        Self {
            state_manager,
            loader,
            threshold_cache: ThresholdCache::new(),
            consecutive: ConsecutiveTracker::new(),
            last_readings: Mutex::new(HashMap::new()),
            warning_cooldown: Mutex::new(HashMap::new()),
        }
    }

    pub fn invalidate_thresholds(&self, stream_id: i64) {
        self.threshold_cache.invalidate(stream_id);
    }

    async fn thresholds_for(&self, stream_id: i64) -> Result<(ThresholdSet, String)> {
        if let Some(cached) = self.threshold_cache.get(stream_id) {
            return Ok(cached);
        }
        let (set, sensor_type) = self.loader.load(stream_id).await?;
        self.threshold_cache.put(stream_id, set, sensor_type.clone());
        Ok((set, sensor_type))
    }

    fn last_reading(&self, stream_id: i64) -> Option<LastReading> {
        self.last_readings.lock().unwrap().get(&stream_id).copied()
    }

    fn record_last_reading(&self, stream_id: i64, value: f64, timestamp: OffsetDateTime) {
        self.last_readings
            .lock()
            .unwrap()
            .insert(stream_id, LastReading { value, timestamp });
    }

    fn in_cooldown(&self, stream_id: i64, now: OffsetDateTime) -> bool {
        self.warning_cooldown
            .lock()
            .unwrap()
            .get(&stream_id)
            .map(|last| (now - *last).whole_seconds() < WARNING_COOLDOWN_SECS)
            .unwrap_or(false)
    }

    fn record_warning(&self, stream_id: i64, now: OffsetDateTime) {
        self.warning_cooldown.lock().unwrap().insert(stream_id, now);
    }

    /// Classify a single observation. Always returns exactly one
    /// `Classification` (spec.md §8 invariant 1); never errors on bad
    /// input — invalid values are a `MlPrediction`, not an `Err`.
    pub async fn classify(
        &self,
        stream_id: i64,
        value: f64,
        device_ts: Option<OffsetDateTime>,
        ingest_ts: OffsetDateTime,
    ) -> Result<Classification> {
        let effective_ts = device_ts.unwrap_or(ingest_ts);

        // 1. Value sanity.
        if !value.is_finite() {
            return Ok(Classification::MlPrediction {
                reason: "invalid".to_string(),
            });
        }

        // 2. State gate.
        let state = self.state_manager.register_valid_reading(stream_id).await?;
        if !state.can_generate_events() {
            return Ok(Classification::MlPrediction {
                reason: format!("state={}", state.as_str()),
            });
        }

        let (thresholds, sensor_type) = self.thresholds_for(stream_id).await?;

        // 3. Physical range, with consecutive-readings hysteresis.
        if let Some(range) = thresholds.physical_range {
            if range.violates(value) {
                let count = self.consecutive.record_violation(stream_id);
                if count < thresholds.consecutive_readings_required {
                    self.record_last_reading(stream_id, value, effective_ts);
                    return Ok(Classification::MlPrediction {
                        reason: "pending hysteresis".to_string(),
                    });
                }
                self.state_manager.transition_to(stream_id, SensorState::Alert).await?;
                self.record_last_reading(stream_id, value, effective_ts);
                info!(stream_id, value, "physical range violation -> ALERT");
                return Ok(Classification::Alert {
                    reason: "physical range violation".to_string(),
                    threshold_id: Some(range.threshold_id),
                });
            } else {
                self.consecutive.reset(stream_id);
            }
        }

        // 4. Warning-band short-circuit.
        if let Some(band) = thresholds.warning_band {
            if band.contains(value) {
                self.record_last_reading(stream_id, value, effective_ts);
                return Ok(Classification::MlPrediction {
                    reason: "inside warning band; delta not applicable".to_string(),
                });
            }
        }

        // 5. History freshness.
        let last = match self.last_reading(stream_id) {
            Some(l) if l.is_fresh(effective_ts) => l,
            _ => {
                self.record_last_reading(stream_id, value, effective_ts);
                return Ok(Classification::MlPrediction {
                    reason: "no recent history".to_string(),
                });
            }
        };

        // 6. Delta-spike detection.
        let delta_threshold = match thresholds.delta {
            Some(d) => d,
            None => {
                self.record_last_reading(stream_id, value, effective_ts);
                return Ok(Classification::MlPrediction {
                    reason: "no delta thresholds configured".to_string(),
                });
            }
        };

        let spike = delta_detector::detect(value, effective_ts, &last, &sensor_type, &delta_threshold);
        self.record_last_reading(stream_id, value, effective_ts);

        let Some(delta_info) = spike else {
            return Ok(Classification::MlPrediction {
                reason: "no spike".to_string(),
            });
        };

        // 7. Cooldown.
        if self.in_cooldown(stream_id, effective_ts) {
            return Ok(Classification::MlPrediction {
                reason: "delta spike in cooldown".to_string(),
            });
        }

        // 8. Fire WARNING.
        self.state_manager.transition_to(stream_id, SensorState::Warning).await?;
        self.record_warning(stream_id, effective_ts);
        warn!(stream_id, value, last_value = last.value, "delta spike -> WARNING");
        Ok(Classification::Warning {
            reason: "delta spike".to_string(),
            delta: delta_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::state_manager::SensorStateStore;
    use crate::observation::{DeltaThreshold, PhysicalRange, Severity, WarningBand};
    use std::collections::HashMap as Map;
    use std::sync::Mutex as StdMutex;

    struct FixedStateStore {
        state: StdMutex<SensorState>,
    }

    #[async_trait]
    impl SensorStateStore for FixedStateStore {
        async fn register_valid_reading(&self, _stream_id: i64) -> Result<SensorState> {
            Ok(*self.state.lock().unwrap())
        }
        async fn current_state(&self, _stream_id: i64) -> Result<SensorState> {
            Ok(*self.state.lock().unwrap())
        }
        async fn try_transition(&self, _stream_id: i64, expected: SensorState, target: SensorState) -> Result<bool> {
            let mut s = self.state.lock().unwrap();
            if *s == expected {
                *s = target;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        async fn sync_state_with_events(&self, _stream_id: i64) -> Result<SensorState> {
            Ok(*self.state.lock().unwrap())
        }
    }

    struct FixedLoader {
        set: ThresholdSet,
        sensor_type: String,
    }

    #[async_trait]
    impl ThresholdLoader for FixedLoader {
        async fn load(&self, _stream_id: i64) -> Result<(ThresholdSet, String)> {
            Ok((self.set, self.sensor_type.clone()))
        }
    }

    fn classifier_with(set: ThresholdSet, initial_state: SensorState) -> Classifier {
        let store = Arc::new(FixedStateStore { state: StdMutex::new(initial_state) });
        let mgr = Arc::new(SensorStateManager::new(store));
        let loader = Arc::new(FixedLoader { set, sensor_type: "temperature".to_string() });
        Classifier::new(mgr, loader)
    }

    #[tokio::test]
    async fn nan_is_always_ml_prediction() {
        let c = classifier_with(ThresholdSet::default(), SensorState::Normal);
        let now = OffsetDateTime::now_utc();
        let result = c.classify(1, f64::NAN, None, now).await.unwrap();
        assert_eq!(result.label(), "ML_PREDICTION");
        assert_eq!(result.reason(), "invalid");
    }

    #[tokio::test]
    async fn initializing_state_never_emits_events() {
        let mut set = ThresholdSet::default();
        set.physical_range = Some(PhysicalRange { threshold_id: 1, min: Some(0.0), max: Some(10.0) });
        let c = classifier_with(set, SensorState::Initializing);
        let now = OffsetDateTime::now_utc();
        let result = c.classify(1, 1000.0, None, now).await.unwrap();
        assert_eq!(result.label(), "ML_PREDICTION");
    }

    #[tokio::test]
    async fn physical_range_violation_needs_consecutive_readings() {
        let mut set = ThresholdSet::default();
        set.physical_range = Some(PhysicalRange { threshold_id: 7, min: Some(10.0), max: Some(30.0) });
        set.consecutive_readings_required = 2;
        let c = classifier_with(set, SensorState::Normal);
        let t0 = OffsetDateTime::now_utc();

        let first = c.classify(1, 35.0, None, t0).await.unwrap();
        assert_eq!(first.label(), "ML_PREDICTION");

        let second = c
            .classify(1, 35.0, None, t0 + time::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(second.label(), "ALERT");
    }

    #[tokio::test]
    async fn warning_band_short_circuits_delta() {
        let mut set = ThresholdSet::default();
        set.warning_band = Some(WarningBand { min: Some(10.0), max: Some(30.0) });
        set.delta = Some(DeltaThreshold {
            abs_delta: Some(2.0),
            rel_delta: None,
            abs_slope: None,
            rel_slope: None,
            severity: Severity::Warning,
        });
        let c = classifier_with(set, SensorState::Normal);
        let t0 = OffsetDateTime::now_utc();
        c.classify(1, 20.0, None, t0).await.unwrap();
        let result = c
            .classify(1, 22.0, None, t0 + time::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(result.label(), "ML_PREDICTION");
        assert_eq!(result.reason(), "inside warning band; delta not applicable");
    }

    #[tokio::test]
    async fn stale_history_yields_ml_prediction() {
        let mut set = ThresholdSet::default();
        set.delta = Some(DeltaThreshold {
            abs_delta: Some(2.0),
            rel_delta: None,
            abs_slope: None,
            rel_slope: None,
            severity: Severity::Warning,
        });
        let c = classifier_with(set, SensorState::Normal);
        let t0 = OffsetDateTime::now_utc();
        c.classify(1, 20.0, None, t0).await.unwrap();
        let result = c
            .classify(1, 25.0, None, t0 + time::Duration::seconds(601))
            .await
            .unwrap();
        assert_eq!(result.label(), "ML_PREDICTION");
        assert_eq!(result.reason(), "no recent history");
    }

    #[tokio::test]
    async fn delta_spike_fires_warning_once_then_cools_down() {
        let mut set = ThresholdSet::default();
        set.delta = Some(DeltaThreshold {
            abs_delta: Some(2.0),
            rel_delta: None,
            abs_slope: None,
            rel_slope: None,
            severity: Severity::Warning,
        });
        let c = classifier_with(set, SensorState::Normal);
        let t0 = OffsetDateTime::now_utc();
        c.classify(1, 20.0, None, t0).await.unwrap();
        let spike = c
            .classify(1, 30.0, None, t0 + time::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(spike.label(), "WARNING");

        let cooled = c
            .classify(1, 40.0, None, t0 + time::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(cooled.label(), "ML_PREDICTION");
        assert_eq!(cooled.reason(), "delta spike in cooldown");
    }
}
