//! Retry utilities with exponential backoff and jitter.
//!
//! Used in two places: the saga runner applies a `RetryConfig` to every
//! step, and read-modify-write updates retry optimistic-concurrency
//! conflicts by re-reading the object.
//!
//! # Example
//!
//! ```ignore
//! use pvscope_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let claim = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "fetch_claim",
//!     &cancel,
//!     || async { client.get_claim("default", "data").await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Longest backoff a config may ask for
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

impl RetryConfig {
    /// Reject configs the backoff arithmetic cannot honor
    pub fn validate(&self) -> Result<(), Error> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation(format!(
                "retry backoff multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay > MAX_RETRY_DELAY {
            return Err(Error::validation(format!(
                "retry max delay {}s exceeds the {}s limit",
                self.max_delay.as_secs(),
                MAX_RETRY_DELAY.as_secs()
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::validation(format!(
                "retry initial delay {}s exceeds max delay {}s",
                self.initial_delay.as_secs(),
                self.max_delay.as_secs()
            )));
        }
        Ok(())
    }

    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Short backoff used to re-read and retry conflicting updates
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry an operation while its error is retryable.
///
/// Equivalent to [`retry_with_backoff_if`] with [`Error::is_retryable`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_with_backoff_if(config, operation_name, cancel, Error::is_retryable, operation).await
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Errors rejected by `should_retry` are returned immediately. The backoff
/// sleep is raced against `cancel`, which ends the loop with
/// `Error::Cancelled`. An invalid `config` fails with `Error::Validation`
/// before the operation runs.
///
/// # Returns
/// The result of the operation, or the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff_if<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    should_retry: P,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    config.validate()?;

    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::try_from_secs_f64(delay.as_secs_f64() * jitter)
                    .unwrap_or(config.max_delay);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(jittered_delay) => {}
                }

                // Exponential backoff, capped at max_delay
                delay = Duration::try_from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                )
                .unwrap_or(config.max_delay);
            }
        }
    }
}
