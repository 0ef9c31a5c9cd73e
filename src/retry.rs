//! Generic async retry with exponential backoff.
//!
//! Nothing here knows about prompts or schemas; the executor and the session
//! coordinator both build on it.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::PersuaderError;

const TRANSIENT_PATTERNS: [&str; 12] = [
    "timeout",
    "timed out",
    "network",
    "econnreset",
    "econnrefused",
    "connection",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "overloaded",
    "socket hang up",
    "service unavailable",
];

/// Backoff schedule shared by every retrying component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Policy that never sleeps between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `retry` (0-based): `min(base * multiplier^retry, max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped.is_infinite() {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }
}

/// Heuristic for failures that may succeed when repeated.
pub fn is_transient_failure(status: Option<u16>, message: &str) -> bool {
    if let Some(status) = status {
        if status >= 500 || status == 408 || status == 429 {
            return true;
        }
    }
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Check if another attempt could plausibly fix `error`.
pub fn is_retryable(error: &PersuaderError) -> bool {
    match error {
        PersuaderError::Validation(err) => err.retryable(),
        PersuaderError::Provider(err) => err.retryable,
        PersuaderError::Session(_) | PersuaderError::Configuration(_) => false,
    }
}

/// Result of [`with_retry`]: the final value or last error, plus the trail.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, PersuaderError>,
    pub attempts: usize,
    pub errors: Vec<PersuaderError>,
}

impl<T> RetryOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, PersuaderError> {
        self.result
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, PersuaderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut errors = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    errors,
                };
            }
            Err(err) => err,
        };

        let retryable = is_retryable(&err);
        warn!(attempt, max_attempts, retryable, error = %err, "Attempt failed");
        errors.push(err.clone());

        if !retryable || attempt >= max_attempts {
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
                errors,
            };
        }

        let delay = policy.delay_for(u32::try_from(attempt - 1).unwrap_or(u32::MAX));
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigurationError, ProviderError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(10_000));
        assert_eq!(RetryPolicy::immediate(3).delay_for(4), Duration::ZERO);
    }

    #[test]
    fn transient_detection() {
        assert!(is_transient_failure(Some(503), "bad gateway"));
        assert!(is_transient_failure(Some(429), ""));
        assert!(is_transient_failure(Some(408), ""));
        assert!(is_transient_failure(None, "Request timed out"));
        assert!(is_transient_failure(None, "ECONNRESET while reading"));
        assert!(!is_transient_failure(Some(400), "bad request"));
        assert!(!is_transient_failure(None, "invalid api key"));
    }

    #[test]
    fn retryability_by_category() {
        let provider = PersuaderError::from(ProviderError::new("mock", "network down"));
        assert!(is_retryable(&provider));

        let config = PersuaderError::from(ConfigurationError::new("bad"));
        assert!(!is_retryable(&config));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        let outcome = with_retry(&RetryPolicy::immediate(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ProviderError::new("mock", "connection refused").into())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.into_result().unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let outcome: RetryOutcome<()> = with_retry(&RetryPolicy::immediate(5), |_| async {
            Err(ProviderError::new("mock", "invalid api key").with_status(401).into())
        })
        .await;

        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.is_ok());
    }

    #[tokio::test]
    async fn exhausts_policy_and_keeps_last_error() {
        let outcome: RetryOutcome<()> = with_retry(&RetryPolicy::immediate(2), |attempt| async move {
            Err(ProviderError::new("mock", format!("timeout {attempt}")).into())
        })
        .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.into_result().unwrap_err().to_string().contains("timeout 2"));
    }
}
