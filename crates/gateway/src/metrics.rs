//! Per-stream metrics and diagnostics (spec.md §4.15). Grounded on the
//! teacher's bounded `VecDeque` ring buffer in `state.rs`, generalized
//! from a single system-wide event log to one ring per stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const RING_CAPACITY: usize = 100;
const MAX_LAG_MS_FOR_PASS: f64 = 200.0;
const MAX_OUT_OF_ORDER_RATE_FOR_PASS: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct Sample {
    delta_secs: Option<f64>,
    lag_ms: f64,
}

#[derive(Default)]
struct StreamMetrics {
    samples: VecDeque<Sample>,
    last_sequence: Option<i64>,
    last_device_ts_secs: Option<f64>,
    out_of_order_count: u64,
    total_count: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Aggregate {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl Aggregate {
    fn from_values(values: &[f64]) -> Option<Aggregate> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let avg = values.iter().sum::<f64>() / n;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;
        Some(Aggregate { avg, min, max, stddev: variance.sqrt() })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamReport {
    pub delta: Option<Aggregate>,
    pub lag: Option<Aggregate>,
    pub out_of_order_rate: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    streams: Mutex<HashMap<i64, StreamMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observed sample. `device_ts`/previous `device_ts` drive
    /// the Δ; `ingest_ts - device_ts` drives the lag.
    pub fn record(
        &self,
        stream_id: i64,
        device_ts_secs: Option<f64>,
        ingest_ts_secs: f64,
        sequence: Option<i64>,
    ) {
        let mut streams = self.streams.lock().unwrap();
        let metrics = streams.entry(stream_id).or_default();

        let lag_ms = device_ts_secs.map(|d| (ingest_ts_secs - d) * 1000.0).unwrap_or(0.0);
        let delta_secs = match (device_ts_secs, metrics.last_device_ts_secs) {
            (Some(d), Some(prev)) => Some(d - prev),
            _ => None,
        };
        if let Some(d) = device_ts_secs {
            metrics.last_device_ts_secs = Some(d);
        }

        metrics.total_count += 1;
        if let (Some(seq), Some(last)) = (sequence, metrics.last_sequence) {
            if seq <= last {
                metrics.out_of_order_count += 1;
            }
        }
        if let Some(seq) = sequence {
            metrics.last_sequence = Some(seq);
        }

        if metrics.samples.len() >= RING_CAPACITY {
            metrics.samples.pop_front();
        }
        metrics.samples.push_back(Sample { delta_secs, lag_ms });
    }

    pub fn stream_report(&self, stream_id: i64) -> Option<StreamReport> {
        let streams = self.streams.lock().unwrap();
        let metrics = streams.get(&stream_id)?;
        let deltas: Vec<f64> = metrics.samples.iter().filter_map(|s| s.delta_secs).collect();
        let lags: Vec<f64> = metrics.samples.iter().map(|s| s.lag_ms).collect();
        let out_of_order_rate = if metrics.total_count > 0 {
            metrics.out_of_order_count as f64 / metrics.total_count as f64
        } else {
            0.0
        };
        Some(StreamReport {
            delta: Aggregate::from_values(&deltas),
            lag: Aggregate::from_values(&lags),
            out_of_order_rate,
            sample_count: metrics.samples.len(),
        })
    }

    pub fn global_report(&self) -> StreamReport {
        let streams = self.streams.lock().unwrap();
        let mut all_lags = Vec::new();
        let mut all_deltas = Vec::new();
        let mut total_ooo = 0u64;
        let mut total = 0u64;
        for metrics in streams.values() {
            all_lags.extend(metrics.samples.iter().map(|s| s.lag_ms));
            all_deltas.extend(metrics.samples.iter().filter_map(|s| s.delta_secs));
            total_ooo += metrics.out_of_order_count;
            total += metrics.total_count;
        }
        StreamReport {
            delta: Aggregate::from_values(&all_deltas),
            lag: Aggregate::from_values(&all_lags),
            out_of_order_rate: if total > 0 { total_ooo as f64 / total as f64 } else { 0.0 },
            sample_count: all_lags.len(),
        }
    }

    pub fn health(&self) -> Health {
        let report = self.global_report();
        let mut reasons = Vec::new();

        let max_lag = report.lag.as_ref().map(|a| a.max).unwrap_or(0.0);
        if max_lag > MAX_LAG_MS_FOR_PASS {
            reasons.push(format!("max ingest lag {max_lag:.1}ms exceeds {MAX_LAG_MS_FOR_PASS}ms"));
        }
        if report.out_of_order_rate > MAX_OUT_OF_ORDER_RATE_FOR_PASS {
            reasons.push(format!(
                "out-of-order rate {:.3} exceeds {MAX_OUT_OF_ORDER_RATE_FOR_PASS}",
                report.out_of_order_rate
            ));
        }

        let status = if reasons.is_empty() {
            HealthStatus::Pass
        } else if reasons.len() == 1 {
            HealthStatus::Warn
        } else {
            HealthStatus::Fail
        };

        Health { status, reasons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_sequence_is_counted() {
        let registry = MetricsRegistry::new();
        registry.record(1, None, 0.0, Some(5));
        registry.record(1, None, 0.0, Some(5)); // equal to last-seen -> out of order
        registry.record(1, None, 0.0, Some(6));
        let report = registry.stream_report(1).unwrap();
        assert!((report.out_of_order_rate - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn health_passes_with_no_samples() {
        let registry = MetricsRegistry::new();
        let health = registry.health();
        assert_eq!(health.status, HealthStatus::Pass);
    }

    #[test]
    fn health_fails_when_lag_and_out_of_order_both_bad() {
        let registry = MetricsRegistry::new();
        for seq in [1, 1, 1, 1] {
            registry.record(1, Some(0.0), 1.0, Some(seq)); // 1000ms lag, repeated sequence
        }
        let health = registry.health();
        assert_eq!(health.status, HealthStatus::Fail);
        assert_eq!(health.reasons.len(), 2);
    }
}
