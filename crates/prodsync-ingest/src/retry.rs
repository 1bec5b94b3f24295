//! Reusable retry policy
//!
//! Exponential backoff with sub-second jitter: the delay before retry `n` (0-based) is
//! `base * 2^n + uniform(0, jitter)`. With the defaults that is `2^n + U(0,1)` seconds.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retries after the first failed attempt
pub const MAX_RETRIES: u32 = 3;

/// Outcome of an operation that failed on every attempt
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Total attempts made, first try included
    pub attempts: u32,
    pub last_error: E,
}

/// Backoff parameters applied uniformly wherever a remote call is retried
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base: Duration::from_secs(1),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the delay before retry `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Full delay before retry `attempt`, jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        };
        self.backoff(attempt) + jitter
    }

    /// Run `operation` until it succeeds or the retry budget is spent.
    ///
    /// The closure receives the 0-based attempt number. On success returns the value
    /// together with the number of retries that were needed.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut f: F,
    ) -> std::result::Result<(T, u32), RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last_error: e,
                    })
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_below_one_second() {
        let policy = RetryPolicy::default();
        for attempt in 0..3 {
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= policy.backoff(attempt));
                assert!(delay < policy.backoff(attempt) + Duration::from_secs(1));
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = RetryPolicy::default().with_jitter(Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (value, retries) = RetryPolicy::default()
            .run("flaky", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(retries, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run("always-down", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(format!("attempt {}", attempt)) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_none_policy_does_not_retry() {
        let err = RetryPolicy::none()
            .run("once", |_| async { Err::<(), _>("down") })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }
}
