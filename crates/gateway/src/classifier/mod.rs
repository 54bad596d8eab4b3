//! The classifier: sensor-state machine, threshold/range evaluation, and
//! delta-spike detection (spec.md §4.6). Grounded on
//! `original_source/ingest_api/classification/*.py` and `sensor_state.py`.

pub mod consecutive_tracker;
pub mod delta_detector;
pub mod reading_classifier;
pub mod state_manager;
pub mod thresholds;

pub use reading_classifier::{Classifier, ThresholdLoader};
pub use state_manager::{SensorStateManager, SensorStateStore};
