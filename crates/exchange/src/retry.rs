//! Bounded retry with exponential backoff and jitter.
//!
//! Each failure is classified through [`Classify`] into a [`Disposition`];
//! only retryable ones are retried. Errors nothing recognises are fatal, and
//! after the last attempt the final error is returned unchanged.

use crate::error::{Disposition, ExchangeError};
use cryptobot_core::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Maps an error onto a retry decision.
pub trait Classify {
    fn disposition(&self) -> Disposition;
}

impl Classify for ExchangeError {
    fn disposition(&self) -> Disposition {
        Self::disposition(self)
    }
}

impl Classify for anyhow::Error {
    fn disposition(&self) -> Disposition {
        self.chain()
            .find_map(|cause| cause.downcast_ref::<ExchangeError>())
            .map_or(Disposition::Fatal, ExchangeError::disposition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
        }
    }

    /// `min(initial × factor^attempt, max)` for a zero-based attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before the next attempt: the backoff plus up to 10% jitter, or
    /// the server's hint when that is longer.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let mut delay = self.backoff(attempt);
        if self.jitter && !delay.is_zero() {
            let fraction: f64 = rand::thread_rng().gen_range(0.0..=0.1);
            delay += delay.mul_f64(fraction);
        }
        hint.map_or(delay, |hint| hint.max(delay))
    }
}

/// Runs `operation` until it succeeds, fails fatally, or exhausts the policy.
///
/// # Errors
///
/// Returns the first fatal error, or the last retryable one once
/// `max_attempts` calls have failed.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let Disposition::Retryable { retry_after } = err.disposition() else {
                    return Err(err);
                };
                if attempt + 1 >= policy.max_attempts {
                    warn!(operation, attempts = attempt + 1, error = %err, "Retries exhausted");
                    return Err(err);
                }
                let delay = policy.delay_for(attempt, retry_after);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, ExchangeError> = retry(&fast_policy(5), "flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(ExchangeError::Network("connection reset".into()))
            } else {
                Ok("filled")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "filled");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_called_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ExchangeError> = retry(&fast_policy(5), "order", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::InsufficientBalance("ab not enough".into()))
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::InsufficientBalance(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ExchangeError> = retry(&fast_policy(3), "tickers", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::Timeout(format!("attempt {n}")))
        })
        .await;

        match result {
            Err(ExchangeError::Timeout(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unrecognised_anyhow_error_is_fatal() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry(&fast_policy(5), "handler", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("index out of range"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let wrapped = anyhow::Error::new(ExchangeError::rate_limit(None)).context("placing order");
        assert!(Classify::disposition(&wrapped).is_retryable());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy {
            jitter: true,
            initial_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(0, None);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_rate_limit_hint_wins_when_longer() {
        let policy = RetryPolicy {
            jitter: false,
            initial_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(10))), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2, Some(Duration::from_millis(10))), Duration::from_secs(4));
    }
}
