//! Structured observability hooks for provisioning runs.
//!
//! This module provides:
//! - A run-scoped tracing span via [`provision_span`]
//! - Emission functions for key run events: step start/finish, state
//!   transitions, poll ticks, retries and run completion
//!
//! Events are emitted at `info!` level unless noted (configurable via
//! `RUST_LOG`). Pass `--json` to the CLI for JSON output.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ApiError, Step};
use crate::state::ProvisionState;

/// Run-scoped span; every event inside a run carries `run_id` and `environment`.
///
/// # Example
///
/// ```ignore
/// let span = provision_span("run-12345", "AppMesh-Workshop");
/// self.execute(&mut tracker, &mut cancel).instrument(span).await
/// ```
pub fn provision_span(run_id: &str, environment: &str) -> tracing::Span {
    tracing::info_span!("c9.provision", run_id = %run_id, environment = %environment)
}

/// Emit event: a run started.
pub fn emit_run_started(run_id: &str, environment: &str, region: &str) {
    info!(event = "run.started", run_id = %run_id, environment = %environment, region = %region);
}

/// Emit event: an external step is about to be called.
pub fn emit_step_started(step: Step) {
    debug!(event = "step.started", step = %step);
}

/// Emit event: an external step returned, with the identifier it produced.
pub fn emit_step_finished(step: Step, result: &str) {
    info!(event = "step.finished", step = %step, result = %result);
}

/// Emit event: the run moved between states.
pub fn emit_state_transition(run_id: &str, from: &ProvisionState, to: &ProvisionState) {
    info!(event = "state.transition", run_id = %run_id, from = %from, to = %to);
}

/// Emit event: a poll check observed a non-terminal value.
pub fn emit_poll_tick(waiting_for: &str, attempt: u32, observed: &str) {
    info!(event = "poll.pending", waiting_for = %waiting_for, attempt = attempt, observed = %observed);
}

/// Emit event: a transient error will be retried (warning level).
pub fn emit_retry(step: Step, attempt: u32, max_attempts: u32, error: &ApiError, delay: Duration) {
    warn!(
        event = "step.retry",
        step = %step,
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay.as_millis() as u64,
        error = %error,
    );
}

/// Emit event: run finished with duration and outcome.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, final_state: &ProvisionState) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        final_state = %final_state,
        success = !matches!(final_state, ProvisionState::Failed(_)),
    );
}

/// Emit event: run failed (warning level).
pub fn emit_run_failed(run_id: &str, kind: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, kind = %kind, error = %error);
}
