//! Per-stream threshold cache plus the per-sensor-type noise floor table
//! (spec.md §4.6 step 6).

use crate::observation::ThresholdSet;
use std::collections::HashMap;
use std::sync::RwLock;

/// `(noise_abs, noise_rel)` per sensor type, grounded on
/// `original_source/ingest_api/classification/thresholds.py`.
pub fn noise_floor(sensor_type: &str) -> (f64, f64) {
    match sensor_type {
        "temperature" => (0.5, 0.02),
        "pressure" => (0.5, 0.005),
        "humidity" => (1.0, 0.03),
        "flow" => (0.2, 0.02),
        _ => (0.1, 0.01),
    }
}

/// In-process cache of `(ThresholdSet, sensor_type)` keyed by stream id.
/// Invalidated explicitly whenever a write touches the underlying row
/// (spec.md §9 "cache invalidation").
#[derive(Default)]
pub struct ThresholdCache {
    entries: RwLock<HashMap<i64, (ThresholdSet, String)>>,
}

impl ThresholdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: i64) -> Option<(ThresholdSet, String)> {
        self.entries.read().unwrap().get(&stream_id).cloned()
    }

    pub fn put(&self, stream_id: i64, set: ThresholdSet, sensor_type: String) {
        self.entries.write().unwrap().insert(stream_id, (set, sensor_type));
    }

    pub fn invalidate(&self, stream_id: i64) {
        self.entries.write().unwrap().remove(&stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_floor_known_types() {
        assert_eq!(noise_floor("temperature"), (0.5, 0.02));
        assert_eq!(noise_floor("pressure"), (0.5, 0.005));
        assert_eq!(noise_floor("unknown-type"), (0.1, 0.01));
    }

    #[test]
    fn cache_put_get_invalidate() {
        let cache = ThresholdCache::new();
        assert!(cache.get(1).is_none());
        cache.put(1, ThresholdSet::default(), "temperature".to_string());
        assert!(cache.get(1).is_some());
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
    }
}
