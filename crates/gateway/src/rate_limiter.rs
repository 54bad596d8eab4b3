//! Sliding-window rate limiter, three scopes checked IP → device → sensor
//! with short-circuit (spec.md §4.3). Grounded on
//! `original_source/ingest_api/rate_limiter.py`.

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

const WINDOW_SECS: f64 = 60.0;
const GC_AGE_SECS: f64 = 300.0;

struct Counter {
    prev_count: u64,
    curr_count: u64,
    window_start: Instant,
}

struct SlidingWindowCounter {
    counters: Mutex<HashMap<String, Counter>>,
}

impl SlidingWindowCounter {
    fn new() -> Self {
        Self { counters: Mutex::new(HashMap::new()) }
    }

    /// Returns the approximate rate after recording one hit for `key`.
    fn hit(&self, key: &str, now: Instant) -> f64 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(key.to_string()).or_insert_with(|| Counter {
            prev_count: 0,
            curr_count: 0,
            window_start: now,
        });

        let elapsed = now.duration_since(counter.window_start).as_secs_f64();
        if elapsed >= WINDOW_SECS {
            // Contiguous rotation: the window that just ended becomes
            // "prev" only if we rotated by exactly one window; otherwise
            // the gap means no continuity and prev resets to 0.
            if elapsed < WINDOW_SECS * 2.0 {
                counter.prev_count = counter.curr_count;
            } else {
                counter.prev_count = 0;
            }
            counter.curr_count = 0;
            counter.window_start = now;
        }

        counter.curr_count += 1;
        let elapsed_in_window = now.duration_since(counter.window_start).as_secs_f64();
        let weight = (1.0 - elapsed_in_window / WINDOW_SECS).max(0.0);
        counter.prev_count as f64 * weight + counter.curr_count as f64
    }

    fn gc(&self, now: Instant) {
        self.counters
            .lock()
            .unwrap()
            .retain(|_, c| now.duration_since(c.window_start).as_secs_f64() < GC_AGE_SECS);
    }
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub scope: &'static str,
    pub approx_count: u64,
    pub limit: u64,
}

pub struct RateLimiter {
    ip_counter: SlidingWindowCounter,
    device_counter: SlidingWindowCounter,
    sensor_counter: SlidingWindowCounter,
    ip_limit: u64,
    device_limit: u64,
    sensor_limit: u64,
}

impl RateLimiter {
    pub fn new(ip_limit: u64, device_limit: u64, sensor_limit: u64) -> Self {
        Self {
            ip_counter: SlidingWindowCounter::new(),
            device_counter: SlidingWindowCounter::new(),
            sensor_counter: SlidingWindowCounter::new(),
            ip_limit,
            device_limit,
            sensor_limit,
        }
    }

    /// IP → device → sensor, short-circuiting on the first violation
    /// (spec.md §4.3, recovered ordering SPEC_FULL.md §B.2).
    pub fn check_all(&self, ip: &str, device: Option<&str>, sensor: Option<&str>) -> RateLimitDecision {
        let now = Instant::now();

        let ip_rate = self.ip_counter.hit(ip, now);
        if ip_rate > self.ip_limit as f64 {
            return RateLimitDecision { allowed: false, scope: "ip", approx_count: ip_rate as u64, limit: self.ip_limit };
        }

        if let Some(device) = device {
            let device_rate = self.device_counter.hit(device, now);
            if device_rate > self.device_limit as f64 {
                return RateLimitDecision {
                    allowed: false,
                    scope: "device",
                    approx_count: device_rate as u64,
                    limit: self.device_limit,
                };
            }
        }

        if let Some(sensor) = sensor {
            let sensor_rate = self.sensor_counter.hit(sensor, now);
            if sensor_rate > self.sensor_limit as f64 {
                return RateLimitDecision {
                    allowed: false,
                    scope: "sensor",
                    approx_count: sensor_rate as u64,
                    limit: self.sensor_limit,
                };
            }
        }

        RateLimitDecision { allowed: true, scope: "none", approx_count: 0, limit: 0 }
    }

    pub fn gc(&self) {
        let now = Instant::now();
        self.ip_counter.gc(now);
        self.device_counter.gc(now);
        self.sensor_counter.gc(now);
    }
}

/// Trust the first hop of `X-Forwarded-For`, then `X-Real-IP`, then the
/// socket peer (SPEC_FULL.md §B.1, grounded on `rate_limiter.py::get_client_ip`).
pub fn client_ip(headers: &HeaderMap, socket_peer: IpAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.trim().is_empty() {
            return real_ip.trim().to_string();
        }
    }
    socket_peer.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_limit_is_allowed() {
        let limiter = RateLimiter::new(10, 10, 10);
        for _ in 0..5 {
            let decision = limiter.check_all("1.2.3.4", None, None);
            assert!(decision.allowed);
        }
    }

    #[test]
    fn over_limit_is_rejected_with_scope() {
        let limiter = RateLimiter::new(3, 100, 100);
        let mut last = None;
        for _ in 0..5 {
            last = Some(limiter.check_all("1.2.3.4", None, None));
        }
        assert!(!last.unwrap().allowed);
    }

    #[test]
    fn checks_short_circuit_ip_before_device() {
        let limiter = RateLimiter::new(1, 100, 100);
        limiter.check_all("1.2.3.4", Some("dev1"), None);
        let decision = limiter.check_all("1.2.3.4", Some("dev1"), None);
        assert_eq!(decision.scope, "ip");
    }

    #[test]
    fn client_ip_prefers_x_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        let ip = client_ip(&headers, "127.0.0.1".parse().unwrap());
        assert_eq!(ip, "10.0.0.1");
    }

    #[test]
    fn client_ip_falls_back_to_socket_peer() {
        let headers = HeaderMap::new();
        let ip = client_ip(&headers, "127.0.0.1".parse().unwrap());
        assert_eq!(ip, "127.0.0.1");
    }
}
