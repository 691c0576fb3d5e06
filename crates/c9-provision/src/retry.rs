//! Retry with exponential backoff for transient API errors.
//!
//! Only errors classified as [`ApiErrorKind::Transient`] (throttling,
//! unavailable, request timeouts) are retried. Everything else is returned
//! on the first failure. A client-side timeout is only retried for steps
//! that are safe to repeat.
//!
//! [`ApiErrorKind::Transient`]: crate::error::ApiErrorKind::Transient

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApiError, ProvisionError, Step};
use crate::obs::emit_retry;
use crate::poll::CancelSignal;
use crate::state::ProvisionState;

/// Backoff policy for transient errors.
///
/// The default mirrors the AWS SDK "standard" retry mode: up to 10 attempts,
/// 1s base delay doubling per attempt, capped at 20s, with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 20_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before the retry that follows attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let delay = if self.jitter {
            // up to 25% on top
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}

/// Pseudo-random jitter factor in `[0.0, 1.0)`.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Run `operation`, retrying transient failures according to `config`.
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once attempts are exhausted. A client-side timeout on a
/// non-idempotent step is returned without retrying. Backoff sleeps end
/// early with [`ProvisionError::Cancelled`] when `cancel` fires.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    step: Step,
    cancel: &CancelSignal,
    during: &ProvisionState,
    operation: F,
) -> Result<T, ProvisionError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut cancel = cancel.clone();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled {
                during: during.clone(),
            });
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(step = %step, attempts = attempt + 1, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if is_retryable(step, &err) && attempt + 1 < max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                emit_retry(step, attempt + 1, max_attempts, &err, delay);
                cancel.sleep(delay, during).await?;
                attempt += 1;
            }
            Err(err) => return Err(ProvisionError::provisioning(step, err)),
        }
    }
}

fn is_retryable(step: Step, err: &ApiError) -> bool {
    err.is_transient() && !(err.is_client_timeout() && !step.is_idempotent())
}
