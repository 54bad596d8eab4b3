//! ALERT/WARNING/PREDICTION sub-pipelines (spec.md §4.7-4.9), invoked by
//! the router once a `Classification` has been produced.

pub mod alert;
pub mod prediction;
pub mod warning;

pub use alert::handle_alert;
pub use prediction::handle_prediction;
pub use warning::handle_warning;
