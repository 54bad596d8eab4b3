//! Per-stream consecutive-out-of-range counter backing the physical-range
//! hysteresis in spec.md §4.6 step 3. Grounded on
//! `original_source/ingest_api/classification/consecutive_tracker.py`
//! (modularized package; default required = 3, see SPEC_FULL.md §C).

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct ConsecutiveTracker {
    counts: Mutex<HashMap<i64, u32>>,
}

impl ConsecutiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an out-of-range reading, return the new consecutive count.
    pub fn record_violation(&self, stream_id: i64) -> u32 {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(stream_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// A value back in range resets the counter to zero.
    pub fn reset(&self, stream_id: i64) {
        self.counts.lock().unwrap().insert(stream_id, 0);
    }

    pub fn current(&self, stream_id: i64) -> u32 {
        *self.counts.lock().unwrap().get(&stream_id).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violations_accumulate_and_reset() {
        let tracker = ConsecutiveTracker::new();
        assert_eq!(tracker.record_violation(1), 1);
        assert_eq!(tracker.record_violation(1), 2);
        assert_eq!(tracker.record_violation(1), 3);
        tracker.reset(1);
        assert_eq!(tracker.current(1), 0);
    }

    #[test]
    fn streams_are_independent() {
        let tracker = ConsecutiveTracker::new();
        tracker.record_violation(1);
        tracker.record_violation(1);
        assert_eq!(tracker.current(1), 2);
        assert_eq!(tracker.current(2), 0);
    }
}
