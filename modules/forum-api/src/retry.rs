use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::cancel::CancelFlag;
use crate::error::{ForumError, Result};

/// Linear backoff: the wait before retry `n` is `base_delay * (n + 1)`. No jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional tries after the first attempt.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay awaited after failed attempt `attempt_index` (0-based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        self.base_delay * (attempt_index + 1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts + 1
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. `op` receives the 0-based attempt index.
///
/// Exhaustion yields `ForumError::RequestFailed` wrapping the last cause.
/// Cancellation is honoured during each attempt and each backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancelFlag,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        let err = match cancel.guard(op(attempt)).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if attempt + 1 >= max_attempts {
            return Err(ForumError::RequestFailed {
                label: label.to_string(),
                attempts: max_attempts,
                source: Box::new(err),
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            label,
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Request failed, retrying after backoff"
        );
        cancel.sleep(delay).await?;
        attempt += 1;
    }
}
