//! Bounded polling and cancellation.
//!
//! [`poll_until`] checks immediately, then sleeps a fixed interval between
//! checks until the check reports [`PollStep::Done`], returns an error, the
//! deadline passes, or the run is cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};

use crate::error::ProvisionError;
use crate::obs::emit_poll_tick;
use crate::state::ProvisionState;

/// Create a linked cancel handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

/// Sender side: call [`CancelHandle::cancel`] to abort a run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver side, threaded through every suspension point of a run.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&mut self, duration: Duration, during: &ProvisionState) -> Result<(), ProvisionError> {
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(ProvisionError::Cancelled { during: during.clone() }),
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// Still waiting; the string is the observed value, for logging.
    Pending(String),
    Done(T),
}

/// Interval and upper bound of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Check until done, bounded by `config.timeout`.
///
/// The check is invoked at least once. Polling stops on the first
/// [`PollStep::Done`] or check error. A check is never started once the
/// next one would begin past the deadline, and a check still in flight at
/// the deadline is dropped; either way the loop fails with
/// [`ProvisionError::Timeout`]. Cancellation also drops an in-flight check.
pub async fn poll_until<F, Fut, T>(
    config: PollConfig,
    waiting_for: &'static str,
    during: &ProvisionState,
    cancel: &mut CancelSignal,
    mut check: F,
) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStep<T>, ProvisionError>>,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled {
                during: during.clone(),
            });
        }

        attempt += 1;
        let step = tokio::select! {
            step = timeout_at(deadline, check()) => step,
            _ = cancel.cancelled() => {
                return Err(ProvisionError::Cancelled {
                    during: during.clone(),
                });
            }
        };
        let Ok(step) = step else {
            return Err(ProvisionError::Timeout {
                waiting_for,
                waited: started.elapsed(),
            });
        };

        match step? {
            PollStep::Done(value) => return Ok(value),
            PollStep::Pending(observed) => {
                emit_poll_tick(waiting_for, attempt, &observed);
            }
        }

        if Instant::now() + config.interval > deadline {
            return Err(ProvisionError::Timeout {
                waiting_for,
                waited: started.elapsed(),
            });
        }
        cancel.sleep(config.interval, during).await?;
    }
}
