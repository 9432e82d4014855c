//! Bounded readiness polling
//!
//! `poll_until` evaluates a predicate immediately and then once per interval
//! until it reports done, fails, times out, or the cancellation token fires.
//! A predicate error ends the wait at once; deciding whether the whole
//! operation is worth retrying is left to the caller.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Poll interval and overall wait budget for one readiness condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSpec {
    /// Time between predicate evaluations
    pub interval: Duration,
    /// Maximum time to wait for the condition
    pub timeout: Duration,
}

impl PollSpec {
    /// Create a poll spec
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Convenience constructor taking whole seconds
    pub const fn secs(interval: u64, timeout: u64) -> Self {
        Self::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    /// Reject intervals that would spin and timeouts past [`MAX_POLL_TIMEOUT`]
    pub fn validate(&self, what: &str) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(Error::validation(format!(
                "poll interval for {} must be positive",
                what
            )));
        }
        if self.timeout > MAX_POLL_TIMEOUT {
            return Err(Error::validation(format!(
                "poll timeout for {} is {}s, above the {}s limit",
                what,
                self.timeout.as_secs(),
                MAX_POLL_TIMEOUT.as_secs()
            )));
        }
        if self.interval > self.timeout {
            return Err(Error::validation(format!(
                "poll interval for {} exceeds its timeout",
                what
            )));
        }
        Ok(())
    }
}

/// Longest wait a single poll may be configured for (one week)
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Poll until a condition is met, the timeout elapses, or the wait is cancelled
///
/// # Arguments
/// * `spec` - Interval and timeout
/// * `what` - Description of the condition, used in errors and logs
/// * `cancel` - Token that aborts the wait with `Error::Cancelled`
/// * `check_fn` - Returns `Ok(true)` when done, `Ok(false)` to keep polling,
///   or `Err` to stop immediately
///
/// # Returns
/// `Ok(())` once the condition holds, `Error::Timeout` when the budget runs
/// out, or `Error::Predicate` wrapping the first predicate failure.
pub async fn poll_until<F, Fut>(
    spec: PollSpec,
    what: &str,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    // A budget past the clock's range never expires
    let deadline = Instant::now().checked_add(spec.timeout);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what = %what, "condition not yet met"),
            Err(e) => return Err(Error::predicate(what, e)),
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(Error::Timeout {
                    what: what.to_string(),
                    seconds: spec.timeout.as_secs(),
                })
            }
            Some(deadline) => spec.interval.min(deadline - now),
            None => spec.interval,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
