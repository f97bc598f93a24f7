//! Retry logic for store operations
//!
//! Exponential backoff with error classification (transient vs permanent).
//! Backoff for attempt `n` is `base_backoff_ms * multiplier^n`, capped.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on retry (lost connection, timeout)
    Transient,

    /// Will not succeed on retry
    Permanent,

    /// Unknown errors - treated as transient
    Unknown,
}

/// Errors that can tell the retry loop whether to try again
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Retry strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,

    /// Backoff before the first retry in milliseconds
    pub base_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Whether to add up to 25% random jitter to backoff delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_backoff(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate backoff delay for a given attempt (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.base_backoff_ms as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u64;

        let delay_ms = delay_ms.min(self.max_backoff_ms);

        let delay_ms = if self.jitter {
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// Execute an async operation with retry logic
///
/// Permanent errors return immediately. Transient and unknown errors are
/// retried up to `config.max_retries` times; the last error is returned
/// once attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Debug,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            info!(
                operation = operation_name,
                attempt = attempt,
                max_retries = config.max_retries,
                "Retrying operation"
            );
        }

        let e = match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        let error_class = e.classify();
        debug!(
            operation = operation_name,
            attempt = attempt,
            error = ?e,
            classification = ?error_class,
            "Operation failed"
        );

        if error_class == ErrorClass::Permanent {
            return Err(e);
        }

        if attempt >= config.max_retries {
            error!(
                operation = operation_name,
                max_retries = config.max_retries,
                error = ?e,
                "All retry attempts exhausted"
            );
            return Err(e);
        }

        let delay = config.backoff_delay(attempt);
        warn!(
            operation = operation_name,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient error, will retry after delay"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl Classify for TestError {
        fn classify(&self) -> ErrorClass {
            match self {
                TestError::Flaky => ErrorClass::Transient,
                TestError::Fatal => ErrorClass::Permanent,
            }
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_backoff_ms, 200);
        assert!(!config.jitter);
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let config = RetryConfig::new(3).with_base_backoff(200);

        assert_eq!(config.backoff_delay(0).as_millis(), 200);
        assert_eq!(config.backoff_delay(1).as_millis(), 400);
        assert_eq!(config.backoff_delay(2).as_millis(), 800);
    }

    #[test]
    fn test_backoff_delay_max_cap() {
        let config = RetryConfig::new(10)
            .with_base_backoff(1000)
            .with_max_backoff(5000);

        assert_eq!(config.backoff_delay(5).as_millis(), 5000);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::new(1).with_base_backoff(1000).with_jitter(true);
        let delay = config.backoff_delay(0).as_millis();
        assert!((1000..=1250).contains(&delay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_after_base_backoff() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(1).with_base_backoff(200);
        let started = tokio::time::Instant::now();

        let result: Result<&str, TestError> = retry_with_backoff(&config, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TestError::Flaky)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200) && waited < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3).with_base_backoff(1);

        let result: Result<(), TestError> = retry_with_backoff(&config, "fatal", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(2).with_base_backoff(10);

        let result: Result<(), TestError> = retry_with_backoff(&config, "down", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Flaky) }
        })
        .await;

        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
