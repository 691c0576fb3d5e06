//! Observability tests for provisioning run tracing.
//!
//! These verify that the structured events for a run (start, step, state
//! transition, poll, retry, finish) are emitted without disturbing the run.

use std::sync::Arc;
use std::time::Duration;

use c9_provision::fakes::ScriptedCloud;
use c9_provision::obs::{
    emit_poll_tick, emit_retry, emit_run_failed, emit_run_finished, emit_run_started,
    emit_state_transition, emit_step_finished, provision_span,
};
use c9_provision::{
    ApiError, CancelSignal, EnvironmentStatus, ProvisionConfig, ProvisionState, Provisioner, Step,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_run_started_logs_environment_and_region() {
    emit_run_started("run-123", "demo", "us-west-2");
    assert!(logs_contain("run.started"));
    assert!(logs_contain("run-123"));
    assert!(logs_contain("us-west-2"));
}

#[traced_test]
#[test]
fn test_emit_step_finished_logs_result() {
    emit_step_finished(Step::CreateEnvironment, "e-123");
    assert!(logs_contain("step.finished"));
    assert!(logs_contain("create_environment"));
    assert!(logs_contain("e-123"));
}

#[traced_test]
#[test]
fn test_emit_state_transition() {
    emit_state_transition(
        "run-456",
        &ProvisionState::EnvCreating,
        &ProvisionState::EnvCreated,
    );
    assert!(logs_contain("state.transition"));
    assert!(logs_contain("ENV_CREATING"));
    assert!(logs_contain("ENV_CREATED"));
}

#[traced_test]
#[test]
fn test_emit_poll_tick() {
    emit_poll_tick("environment ready", 2, "CREATING");
    assert!(logs_contain("poll.pending"));
    assert!(logs_contain("CREATING"));
}

/// Retry events are emitted at warn level
#[traced_test]
#[test]
fn test_emit_retry_logs_warning() {
    let err = ApiError::transient("Rate exceeded").with_code("Throttling");
    emit_retry(Step::CreateRole, 1, 10, &err, Duration::from_millis(1000));
    assert!(logs_contain("WARN"));
    assert!(logs_contain("step.retry"));
    assert!(logs_contain("Throttling: Rate exceeded"));
}

#[traced_test]
#[test]
fn test_emit_run_finished_and_failed() {
    emit_run_finished("run-789", 1234, &ProvisionState::BootstrapDispatched);
    emit_run_failed("run-789", "instance_not_found", &"no instance found");
    emit_run_finished(
        "run-789",
        1234,
        &ProvisionState::Failed("no instance found".to_string()),
    );
    assert!(logs_contain("run.finished"));
    assert!(logs_contain("run.failed"));
    assert!(logs_contain("instance_not_found"));
}

#[traced_test]
#[test]
fn test_provision_span_enter() {
    let span = provision_span("test-span-run", "demo");
    let _guard = span.enter();
    emit_step_finished(Step::SendCommand, "cmd-1");
    assert!(logs_contain("test-span-run"));
    assert!(logs_contain("cmd-1"));
}

/// A full run inside a traced test emits transitions for every state.
#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_full_run_is_traced() {
    let cloud = Arc::new(ScriptedCloud::new().with_environment_statuses(vec![
        EnvironmentStatus::Creating,
        EnvironmentStatus::Created,
    ]));
    let provisioner =
        Provisioner::new(cloud, ProvisionConfig::named("demo")).expect("valid config");

    let report = provisioner.run(CancelSignal::never()).await;

    assert!(report.succeeded());
    assert_eq!(report.final_state(), &ProvisionState::BootstrapDispatched);
    assert!(logs_contain("run.started"));
    assert!(logs_contain("state.transition"));
    assert!(logs_contain("BOOTSTRAP_DISPATCHED"));
    assert!(logs_contain("poll.pending"));
    assert!(logs_contain("run.finished"));
}
