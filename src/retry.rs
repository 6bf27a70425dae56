//! Provider-level retry policy.
//!
//! This sits inside a single task attempt: a producer that reports a
//! retryable error is called again after a delay until the policy runs out.
//! Only then does the failure count against the task's `max_attempts`.

use std::future::Future;
use std::time::Duration;

use crate::producer::ProducerError;

/// Policy for re-invoking a producer within one attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetryPolicy {
    /// No in-attempt retries.
    #[default]
    None,

    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retries.
        max_retries: u32,
        /// Delay between retries.
        delay: Duration,
    },

    /// Exponential backoff between retries.
    Exponential {
        /// Maximum number of retries.
        max_retries: u32,
        /// Initial delay (doubles each retry).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Exponential backoff from 1 second, capped at 1 minute.
    pub fn exponential(max_retries: u32) -> Self {
        Self::Exponential {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Delay before retry number `retry` (1-indexed), or `None` once exhausted.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_retries, delay } => (retry <= *max_retries).then_some(*delay),
            Self::Exponential {
                max_retries,
                initial_delay,
                max_delay,
            } => {
                if retry > *max_retries {
                    return None;
                }
                let multiplier = 2u64.saturating_pow(retry.saturating_sub(1));
                let delay_ms = (initial_delay.as_millis() as u64).saturating_mul(multiplier);
                Some(Duration::from_millis(delay_ms.min(max_delay.as_millis() as u64)))
            }
        }
    }

    /// Returns the maximum number of retries allowed.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } => *max_retries,
            Self::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, mut call: F) -> Result<T, ProducerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        let mut retry = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(ProducerError::Retryable(e)) => {
                    retry += 1;
                    match self.delay_for_retry(retry) {
                        Some(delay) => {
                            tracing::debug!(retry, delay_ms = delay.as_millis() as u64, error = %e, "retrying producer");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(ProducerError::Retryable(e)),
                    }
                }
                Err(permanent) => return Err(permanent),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.delay_for_retry(1), None);
        assert_eq!(policy.max_retries(), 0);
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_retry(3), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_retry(4), None);
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let policy = RetryPolicy::Exponential {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(policy.delay_for_retry(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_retry(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for_retry(7), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for_retry(11), None);
    }

    #[tokio::test]
    async fn run_retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = policy
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProducerError::retryable(anyhow::anyhow!("busy")))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let result: Result<(), _> = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProducerError::permanent(anyhow::anyhow!("invalid input")))
            })
            .await;

        assert!(matches!(result, Err(ProducerError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
