//! Retry-with-backoff for transient DB errors (spec.md §4.13).

use rand::Rng;
use std::time::Duration;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..=0.10);
        let jittered = capped as f64 * (1.0 - jitter_frac);
        Duration::from_millis(jittered as u64)
    }

    /// Runs `f`, retrying up to `max_attempts` total attempts when
    /// `is_retryable` returns `true` for the error. Non-retryable errors
    /// propagate immediately (spec.md §4.13).
    pub async fn run<F, Fut, T, E>(&self, is_retryable: impl Fn(&E) -> bool, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.max_attempts || !is_retryable(&e) {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_up_to_max_attempts_then_propagates() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = policy
            .run(
                |_| true,
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("transient") }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_propagates_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = policy
            .run(
                |_| false,
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("permanent") }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let result: Result<&str, &str> = policy
            .run(
                |_| true,
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move { if n == 0 { Err("transient") } else { Ok("ok") } }
                },
            )
            .await;
        assert_eq!(result, Ok("ok"));
    }
}
