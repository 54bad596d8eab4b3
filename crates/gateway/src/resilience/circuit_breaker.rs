//! Three-state circuit breaker wrapping DB-write calls (spec.md §4.12).
//! Grounded on `original_source/ingest_api/pipelines/resilience/circuit_breaker.py`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
}

pub struct CircuitOpenError {
    pub remaining: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            success_threshold,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `Err` immediately (fast-fail, <1ms) if the breaker is open
    /// and the recovery timeout hasn't elapsed yet. Otherwise runs `f` and
    /// records the outcome.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                BreakerState::Open => {
                    let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                    if elapsed >= self.recovery_timeout {
                        inner.state = BreakerState::HalfOpen;
                        inner.success_count = 0;
                    } else {
                        return Err(CallOutcome::CircuitOpen(self.recovery_timeout - elapsed));
                    }
                }
                BreakerState::Closed | BreakerState::HalfOpen => {}
            }
        }

        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(CallOutcome::Inner(e))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }
}

pub enum CallOutcome<E> {
    CircuitOpen(Duration),
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new("db", 3, Duration::from_secs(30), 2);
        for _ in 0..3 {
            let _: Result<(), CallOutcome<&str>> = cb.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(cb.stats().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn fast_fails_while_open() {
        let cb = CircuitBreaker::new("db", 1, Duration::from_secs(30), 2);
        let _: Result<(), CallOutcome<&str>> = cb.call(|| async { Err::<(), _>("boom") }).await;
        let result: Result<(), CallOutcome<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CallOutcome::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_open_recovers_to_closed_after_successes() {
        let cb = CircuitBreaker::new("db", 1, Duration::from_millis(10), 2);
        let _: Result<(), CallOutcome<&str>> = cb.call(|| async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _: Result<(), CallOutcome<&str>> = cb.call(|| async { Ok(()) }).await;
        assert_eq!(cb.stats().state, BreakerState::HalfOpen);
        let _: Result<(), CallOutcome<&str>> = cb.call(|| async { Ok(()) }).await;
        assert_eq!(cb.stats().state, BreakerState::Closed);
    }
}
