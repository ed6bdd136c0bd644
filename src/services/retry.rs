//! Bounded retry executor with jittered exponential backoff.
//!
//! Wraps outbound calls to workers and other collaborators. Errors are
//! classified as transient (retried) or terminal (returned immediately);
//! the final attempt's result is always surfaced, never swallowed.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry configuration for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
        }
    }
}

/// Error returned by a retried operation, carrying its retry class.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Transient condition: network failure, 5xx-equivalent, rate-limit
    /// signal. Retried until attempts are exhausted.
    #[error("transient: {0}")]
    Transient(String),
    /// Well-formed client-side rejection: validation error, permission
    /// denial. Returned immediately without consuming further attempts.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl RetryError {
    /// Classify an HTTP status code the way the dispatch path needs:
    /// 5xx and 429 are transient, other 4xx are terminal.
    pub fn from_status(status: u16, context: &str) -> Self {
        if status >= 500 || status == 429 {
            Self::Transient(format!("{context}: status {status}"))
        } else {
            Self::Terminal(format!("{context}: status {status}"))
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for RetryError {
    fn from(e: reqwest::Error) -> Self {
        // Connection failures and timeouts are transient by definition; a
        // body/decode error means the worker answered and retrying is
        // pointless.
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::Transient(e.to_string())
        } else {
            Self::Terminal(e.to_string())
        }
    }
}

/// Compute the backoff delay before the given retry (attempt is 1-based).
///
/// delay = min(max_delay, base * 2^(attempt-1) * (1 + jitter)), jitter in
/// [0, 0.3), so concurrent callers do not synchronize their retries.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_delay
        .as_millis()
        .saturating_mul(1u128 << (attempt.saturating_sub(1)).min(20));
    let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.3);
    let with_jitter = (exp as f64 * jitter) as u128;
    Duration::from_millis(with_jitter.min(policy.max_delay.as_millis()) as u64)
}

/// Invoke `op` up to `policy.max_attempts` times.
///
/// The operation is re-created per attempt via the factory closure. At most
/// `max_attempts` physical calls happen; the last result (success or error)
/// is returned as-is.
pub async fn invoke<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let mut last_err: Option<RetryError> = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if !e.is_transient() {
                    return Err(e);
                }
                if attempt < policy.max_attempts {
                    let delay = backoff_delay(policy, attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| RetryError::Transient("no attempts made".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_makes_one_call() {
        let calls = AtomicU32::new(0);
        let result = invoke(&fast_policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RetryError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds_makes_three_calls() {
        let calls = AtomicU32::new(0);
        let result = invoke(&fast_policy(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RetryError::Transient("503".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = invoke(&fast_policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryError::Terminal("400".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Terminal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = invoke(&fast_policy(2), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryError::Transient("timeout".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn status_classification() {
        assert!(RetryError::from_status(503, "worker").is_transient());
        assert!(RetryError::from_status(429, "worker").is_transient());
        assert!(!RetryError::from_status(400, "worker").is_transient());
        assert!(!RetryError::from_status(403, "worker").is_transient());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        let d1 = backoff_delay(&policy, 1);
        // attempt 1: 100ms * [1.0, 1.3)
        assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(130));
        // attempt 4 would be 800ms+ before capping
        let d4 = backoff_delay(&policy, 4);
        assert_eq!(d4, Duration::from_millis(500));
    }
}
