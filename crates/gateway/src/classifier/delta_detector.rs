//! Delta-spike detection (spec.md §4.6 step 6). Grounded on
//! `original_source/ingest_api/classification/delta_detector.py`.

use crate::observation::{DeltaInfo, DeltaThreshold, LastReading, Severity};
use super::thresholds::noise_floor;
use time::OffsetDateTime;

/// `None` means "no spike" (either inside the noise floor or no threshold
/// crossed); `Some` carries the numerics for the WARNING payload.
pub fn detect(
    value: f64,
    now: OffsetDateTime,
    last: &LastReading,
    sensor_type: &str,
    thresholds: &DeltaThreshold,
) -> Option<DeltaInfo> {
    let delta_abs = (value - last.value).abs();
    let delta_rel = if last.value.abs() > 1e-6 {
        delta_abs / last.value.abs()
    } else {
        0.0
    };

    let dt = (now - last.timestamp).as_seconds_f64().max(0.001);

    let (noise_abs, noise_rel) = noise_floor(sensor_type);
    if delta_abs < noise_abs && delta_rel < noise_rel {
        return None;
    }

    let (slope_abs, slope_rel) = if dt >= 1.0 {
        (Some(delta_abs / dt), Some(delta_rel / dt))
    } else {
        (None, None)
    };

    let mut triggered = Vec::new();
    if let Some(t) = thresholds.abs_delta {
        if delta_abs >= t {
            triggered.push("abs_delta");
        }
    }
    if let Some(t) = thresholds.rel_delta {
        if delta_rel >= t {
            triggered.push("rel_delta");
        }
    }
    if let (Some(t), Some(slope)) = (thresholds.abs_slope, slope_abs) {
        if slope >= t {
            triggered.push("abs_slope");
        }
    }
    if let (Some(t), Some(slope)) = (thresholds.rel_slope, slope_rel) {
        if slope >= t {
            triggered.push("rel_slope");
        }
    }

    if triggered.is_empty() {
        return None;
    }

    Some(DeltaInfo {
        delta_abs,
        delta_rel,
        slope_abs,
        slope_rel,
        last_value: last.value,
        triggered_thresholds: triggered,
        severity: thresholds.severity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value: f64, secs_ago: i64) -> LastReading {
        LastReading {
            value,
            timestamp: OffsetDateTime::now_utc() - time::Duration::seconds(secs_ago),
        }
    }

    fn thresholds() -> DeltaThreshold {
        DeltaThreshold {
            abs_delta: Some(5.0),
            rel_delta: Some(0.2),
            abs_slope: Some(2.0),
            rel_slope: None,
            severity: Severity::Warning,
        }
    }

    #[test]
    fn below_noise_floor_is_not_a_spike() {
        let last = reading(20.0, 5);
        let result = detect(20.05, OffsetDateTime::now_utc(), &last, "temperature", &thresholds());
        assert!(result.is_none());
    }

    #[test]
    fn crossing_abs_delta_triggers_spike() {
        let last = reading(20.0, 5);
        let result = detect(30.0, OffsetDateTime::now_utc(), &last, "temperature", &thresholds());
        let info = result.expect("spike expected");
        assert!(info.triggered_thresholds.contains(&"abs_delta"));
    }

    #[test]
    fn slope_gate_skipped_under_one_second() {
        let last = reading(20.0, 0);
        let now = OffsetDateTime::now_utc();
        let result = detect(30.0, now, &last, "temperature", &thresholds());
        if let Some(info) = result {
            assert!(info.slope_abs.is_none());
        }
    }
}
