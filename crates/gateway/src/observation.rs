//! Canonical `Observation` and the types surrounding it — the shape every
//! transport decoder converges on before the observation enters the
//! pipeline (see SPEC_FULL.md §A / spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;

/// `"{domain}:{source}:{stream}"` — the primary cross-domain identity for a
/// time series. Legacy IoT streams also carry a `legacy_stream_int`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesId(pub String);

impl SeriesId {
    pub fn new(domain: &str, source: &str, stream: &str) -> Self {
        Self(format!("{domain}:{source}:{stream}"))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Pending,
    Validated,
    Classified,
    Persisted,
    Rejected,
    Failed,
}

/// The canonical unit flowing through the core pipeline. Every transport
/// decoder (HTTP packet, universal HTTP, MQTT) produces one of these per
/// reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub series_id: SeriesId,
    pub legacy_stream_int: Option<i64>,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub device_ts: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub ingest_ts: OffsetDateTime,
    pub sequence: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub status: ObservationStatus,
}

impl Observation {
    pub fn new(series_id: SeriesId, value: f64, ingest_ts: OffsetDateTime) -> Self {
        Self {
            series_id,
            legacy_stream_int: None,
            value,
            device_ts: None,
            ingest_ts,
            sequence: None,
            metadata: HashMap::new(),
            status: ObservationStatus::Pending,
        }
    }

    /// Value sanity per spec.md §3: NaN and ±∞ are never classified.
    pub fn has_finite_value(&self) -> bool {
        self.value.is_finite()
    }

    /// The timestamp used to evaluate freshness/delta logic: `device_ts` if
    /// present, else `ingest_ts`.
    pub fn effective_ts(&self) -> OffsetDateTime {
        self.device_ts.unwrap_or(self.ingest_ts)
    }
}

/// Outcome of `Classifier::classify` — exactly one of these is produced for
/// every observation (spec.md §8, invariant 1).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "classification", rename_all = "snake_case")]
pub enum Classification {
    Alert {
        reason: String,
        threshold_id: Option<i64>,
    },
    Warning {
        reason: String,
        delta: DeltaInfo,
    },
    MlPrediction {
        reason: String,
    },
}

impl Classification {
    pub fn reason(&self) -> &str {
        match self {
            Classification::Alert { reason, .. } => reason,
            Classification::Warning { reason, .. } => reason,
            Classification::MlPrediction { reason } => reason,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Classification::Alert { .. } => "ALERT",
            Classification::Warning { .. } => "WARNING",
            Classification::MlPrediction { .. } => "ML_PREDICTION",
        }
    }
}

/// Numerics captured when a delta spike fires (spec.md §4.6 step 6).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaInfo {
    pub delta_abs: f64,
    pub delta_rel: f64,
    pub slope_abs: Option<f64>,
    pub slope_rel: Option<f64>,
    pub last_value: f64,
    pub triggered_thresholds: Vec<&'static str>,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Operational state machine for a stream (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorState {
    Initializing,
    Normal,
    Warning,
    Alert,
    Stale,
    Unknown,
}

impl SensorState {
    /// Invariant: only NORMAL, WARNING, ALERT may emit WARNING/ALERT events.
    pub fn can_generate_events(self) -> bool {
        matches!(self, SensorState::Normal | SensorState::Warning | SensorState::Alert)
    }

    /// spec.md §3's valid-transition table.
    pub fn can_transition_to(self, target: SensorState) -> bool {
        use SensorState::*;
        if self == target {
            return true; // idempotent no-op, not a new transition
        }
        matches!(
            (self, target),
            (Initializing, Normal)
                | (Initializing, Stale)
                | (Normal, Warning)
                | (Normal, Alert)
                | (Normal, Stale)
                | (Warning, Normal)
                | (Warning, Alert)
                | (Warning, Stale)
                | (Alert, Normal)
                | (Alert, Stale)
                | (Stale, Initializing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorState::Initializing => "INITIALIZING",
            SensorState::Normal => "NORMAL",
            SensorState::Warning => "WARNING",
            SensorState::Alert => "ALERT",
            SensorState::Stale => "STALE",
            SensorState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> SensorState {
        match s {
            "INITIALIZING" => SensorState::Initializing,
            "NORMAL" => SensorState::Normal,
            "WARNING" => SensorState::Warning,
            "ALERT" => SensorState::Alert,
            "STALE" => SensorState::Stale,
            _ => SensorState::Unknown,
        }
    }
}

/// Cached physical-range thresholds for a stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalRange {
    pub threshold_id: i64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl PhysicalRange {
    pub fn violates(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return true;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return true;
            }
        }
        false
    }
}

/// Warning band — "the user declared this range normal" (spec.md §4.6 step 4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarningBand {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl WarningBand {
    pub fn contains(&self, value: f64) -> bool {
        if self.min.is_none() && self.max.is_none() {
            return false;
        }
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}

/// Delta/slope thresholds for spike detection (spec.md §3 ThresholdSet).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaThreshold {
    pub abs_delta: Option<f64>,
    pub rel_delta: Option<f64>,
    pub abs_slope: Option<f64>,
    pub rel_slope: Option<f64>,
    pub severity: Severity,
}

/// The full per-stream threshold configuration cached by the classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdSet {
    pub physical_range: Option<PhysicalRange>,
    pub warning_band: Option<WarningBand>,
    pub delta: Option<DeltaThreshold>,
    pub consecutive_readings_required: u32,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            physical_range: None,
            warning_band: None,
            delta: None,
            // Modularized classifier semantics per SPEC_FULL.md §C.
            consecutive_readings_required: 3,
        }
    }
}

/// Last accepted reading for a stream, used for delta-spike and dedup
/// comparisons. Stale (> 10 min old) entries are treated as absent by
/// callers — see `LastReading::is_fresh`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastReading {
    pub value: f64,
    pub timestamp: OffsetDateTime,
}

impl LastReading {
    pub const MAX_AGE_SECS: i64 = 600;

    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        (now - self.timestamp).whole_seconds() <= Self::MAX_AGE_SECS
    }
}
