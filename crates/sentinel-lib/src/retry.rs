//! Parameterized retry with exponential backoff and jitter
//!
//! Single combinator used by every call-site that retries: engine reattach,
//! gateway invocations, inference transport. Structural errors must be
//! filtered out by the caller's `is_transient` predicate.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay randomized on top (0.0 disables jitter)
    pub jitter: f64,
}

impl RetryPolicy {
    /// Gateway invocation schedule: 3 attempts at 1 s and 3 s
    pub fn gateway() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 3.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }

    /// Engine reattach schedule: unbounded attempts, 1 s doubling up to 30 s
    pub fn engine_reattach() -> Self {
        Self {
            attempts: u32::MAX,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }

    /// Backoff delay before the given retry (`retry` is 1 for the first retry)
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            capped + rand::thread_rng().gen_range(0.0..capped * self.jitter)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Run `op` until it succeeds, the error stops being transient, or the policy
/// is exhausted. The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_transient: P, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts && is_transient(&err) => {
                let delay = policy.delay(attempt);
                debug!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_secs(1),
            multiplier: 3.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(3));
        assert_eq!(policy.delay(3), Duration::from_secs(9));
        // capped
        assert_eq!(policy.delay(4), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_secs(2),
            multiplier: 1.0,
            max_delay: Duration::from_secs(2),
            jitter: 0.5,
        };
        for _ in 0..32 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(&fast_policy(5), |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("flaky".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_structural_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(&fast_policy(5), |_| false, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("structural".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(&fast_policy(3), |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {attempt}")) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
