//! End-to-end provisioning workflow tests against the scripted fake.
//!
//! Time is paused, so settle delays and poll intervals elapse instantly
//! while keeping their ordering.

use std::sync::Arc;
use std::time::Duration;

use c9_provision::fakes::{ApiCall, ScriptedCloud};
use c9_provision::{
    cancellation, ApiError, ApiErrorKind, Association, DiscoveryMode, EnvironmentDescription,
    EnvironmentStatus, InstanceState, InstanceSummary, ProvisionConfig, ProvisionError,
    ProvisionState, Provisioner, RetryConfig, Step, TimingConfig,
};

fn demo_config() -> ProvisionConfig {
    ProvisionConfig::named("demo").with_region("us-west-2")
}

fn provisioner(cloud: &Arc<ScriptedCloud>, config: ProvisionConfig) -> Provisioner {
    Provisioner::new(cloud.clone(), config).expect("valid config")
}

fn pending(id: &str) -> InstanceSummary {
    InstanceSummary::new(id, InstanceState::Pending).with_tag("Env", "demo-E")
}

fn running(id: &str) -> InstanceSummary {
    InstanceSummary::new(id, InstanceState::Running).with_tag("Env", "demo-E")
}

fn state_names(states: &[c9_provision::StateTransition]) -> Vec<&'static str> {
    states.iter().map(|t| t.state.name()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_pending_then_running() {
    let cloud = Arc::new(
        ScriptedCloud::new()
            .with_environment_id("e-123")
            .with_instance_lookups(vec![vec![pending("i-1")], vec![running("i-1")]])
            .with_environment_statuses(vec![
                EnvironmentStatus::Creating,
                EnvironmentStatus::Creating,
                EnvironmentStatus::Created,
            ])
            .with_command_id("cmd-42"),
    );

    let outcome = provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("provisioning succeeds");

    assert_eq!(outcome.environment_id.as_str(), "e-123");
    assert_eq!(outcome.instance_id.as_str(), "i-1");
    assert_eq!(outcome.command_id.as_str(), "cmd-42");
    assert_eq!(outcome.environment_status, EnvironmentStatus::Created);
    assert_eq!(outcome.instance_state, InstanceState::Running);

    let associations: Vec<_> = cloud
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ApiCall::AssociateInstanceProfile { .. }))
        .collect();
    assert_eq!(
        associations,
        vec![ApiCall::AssociateInstanceProfile {
            profile_name: "demo-Profile".to_string(),
            instance_id: "i-1".to_string(),
        }]
    );
    assert_eq!(cloud.count(Step::DescribeEnvironment), 3);
}

#[tokio::test(start_paused = true)]
async fn test_calls_follow_dependency_order() {
    let cloud = Arc::new(
        ScriptedCloud::new()
            .with_instance_lookups(vec![vec![pending("i-1")], vec![running("i-1")]]),
    );

    provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("provisioning succeeds");

    assert_eq!(
        cloud.steps(),
        vec![
            Step::CreateEnvironment,
            Step::CreateRole,
            Step::AttachManagedPolicy,
            Step::CreateInstanceProfile,
            Step::AddRoleToInstanceProfile,
            Step::DescribeInstances,
            Step::DescribeInstances,
            Step::AssociateInstanceProfile,
            Step::DescribeEnvironment,
            Step::SendCommand,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_request_contents() {
    let cloud = Arc::new(ScriptedCloud::new().with_environment_id("e-9"));

    provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("provisioning succeeds");

    let calls = cloud.calls();

    let ApiCall::CreateEnvironment(request) = &calls[0] else {
        panic!("first call should create the environment, got {:?}", calls[0]);
    };
    assert_eq!(request.name, "demo");
    assert_eq!(request.tags.len(), 1);
    assert_eq!(request.tags[0].key, "Env");
    assert_eq!(request.tags[0].value, "demo-E");

    let ApiCall::CreateRole {
        role_name,
        trust_policy,
    } = &calls[1]
    else {
        panic!("second call should create the role, got {:?}", calls[1]);
    };
    assert_eq!(role_name, "demo-Admin");
    let policy: serde_json::Value = serde_json::from_str(trust_policy).unwrap();
    assert_eq!(
        policy["Statement"][0]["Principal"]["Service"],
        "ec2.amazonaws.com"
    );

    assert!(calls.contains(&ApiCall::AttachManagedPolicy {
        role_name: "demo-Admin".to_string(),
        policy_arn: "arn:aws:iam::aws:policy/AdministratorAccess".to_string(),
    }));
    assert!(calls.contains(&ApiCall::AddRoleToInstanceProfile {
        profile_name: "demo-Profile".to_string(),
        role_name: "demo-Admin".to_string(),
    }));

    let ApiCall::SendCommand(command) = calls.last().unwrap() else {
        panic!("last call should dispatch the bootstrap command");
    };
    assert_eq!(command.instance_id.as_str(), "i-1");
    assert_eq!(command.document_name, "AWS-RunShellScript");
    assert_eq!(command.commands.len(), 3);
    assert_eq!(command.working_directory, "/home/ec2-user/environment");
}

#[tokio::test(start_paused = true)]
async fn test_already_running_skips_pending_state() {
    let cloud = Arc::new(ScriptedCloud::new());

    let report = provisioner(&cloud, demo_config())
        .run(c9_provision::CancelSignal::never())
        .await;

    assert!(report.succeeded());
    assert_eq!(
        state_names(&report.states),
        vec![
            "INIT",
            "ENV_CREATING",
            "ENV_CREATED",
            "INSTANCE_DISCOVERING",
            "INSTANCE_RUNNING",
            "PROFILE_ATTACHED",
            "ENV_VALIDATING",
            "ENV_READY",
            "BOOTSTRAP_DISPATCHED",
        ]
    );
    assert_eq!(cloud.count(Step::DescribeInstances), 1);
}

#[tokio::test(start_paused = true)]
async fn test_settle_delay_precedes_discovery() {
    let cloud = Arc::new(ScriptedCloud::new());
    let started = tokio::time::Instant::now();

    provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("provisioning succeeds");

    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_no_instance_found() {
    let cloud = Arc::new(ScriptedCloud::new().with_instance_lookups(vec![vec![]]));

    let report = provisioner(&cloud, demo_config())
        .run(c9_provision::CancelSignal::never())
        .await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::InstanceNotFound { ref filter }) if filter == "tag:Env=demo-E"
    ));
    assert!(matches!(report.final_state(), ProvisionState::Failed(_)));
    assert_eq!(cloud.count(Step::AssociateInstanceProfile), 0);
    assert_eq!(cloud.count(Step::SendCommand), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_stops_later_steps() {
    let cloud = Arc::new(
        ScriptedCloud::new().fail_always(
            Step::CreateRole,
            ApiError::new(ApiErrorKind::Rejected, "access denied").with_code("AccessDenied"),
        ),
    );

    let err = provisioner(&cloud, demo_config())
        .provision()
        .await
        .unwrap_err();

    match err {
        ProvisionError::Provisioning { step, source } => {
            assert_eq!(step, Step::CreateRole);
            assert_eq!(source.code.as_deref(), Some("AccessDenied"));
        }
        other => panic!("expected provisioning error, got {other:?}"),
    }
    assert_eq!(cloud.steps(), vec![Step::CreateEnvironment, Step::CreateRole]);
}

#[tokio::test(start_paused = true)]
async fn test_existing_role_is_not_tolerated() {
    let cloud = Arc::new(ScriptedCloud::new().fail_always(
        Step::CreateRole,
        ApiError::new(ApiErrorKind::AlreadyExists, "role exists").with_code("EntityAlreadyExists"),
    ));

    let err = provisioner(&cloud, demo_config())
        .provision()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "provisioning_error");
    assert_eq!(cloud.count(Step::CreateRole), 1);
    assert_eq!(cloud.count(Step::CreateInstanceProfile), 0);
}

#[tokio::test(start_paused = true)]
async fn test_instance_leaves_pending_for_stopped() {
    let cloud = Arc::new(ScriptedCloud::new().with_instance_lookups(vec![
        vec![pending("i-1")],
        vec![InstanceSummary::new("i-1", InstanceState::Stopped)],
    ]));

    let err = provisioner(&cloud, demo_config())
        .provision()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::UnexpectedState { ref instance_id, ref state }
            if instance_id == "i-1" && state == "stopped"
    ));
    assert_eq!(cloud.count(Step::AssociateInstanceProfile), 0);
}

#[tokio::test(start_paused = true)]
async fn test_environment_create_failed() {
    let cloud = Arc::new(ScriptedCloud::new().with_environment_descriptions(vec![
        EnvironmentDescription::new(EnvironmentStatus::Creating),
        EnvironmentDescription {
            status: EnvironmentStatus::CreateFailed,
            reason: Some("subnet has no route to the internet".to_string()),
        },
    ]));

    let err = provisioner(&cloud, demo_config())
        .provision()
        .await
        .unwrap_err();

    match err {
        ProvisionError::EnvironmentFailed { status, reason, .. } => {
            assert_eq!(status, "CREATE_FAILED");
            assert_eq!(
                reason.as_deref(),
                Some("subnet has no route to the internet")
            );
        }
        other => panic!("expected environment failure, got {other:?}"),
    }
    assert_eq!(cloud.count(Step::SendCommand), 0);
}

#[tokio::test(start_paused = true)]
async fn test_instance_poll_times_out() {
    let cloud = Arc::new(ScriptedCloud::new().with_instance_lookups(vec![vec![pending("i-1")]]));
    let timing = TimingConfig {
        settle_delay_secs: 30,
        poll_interval_secs: 5,
        instance_timeout_secs: 20,
        environment_timeout_secs: 60,
    };

    let err = provisioner(&cloud, demo_config().with_timing(timing))
        .provision()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Timeout {
            waiting_for: "instance running",
            ..
        }
    ));
    assert_eq!(cloud.count(Step::AssociateInstanceProfile), 0);
}

#[tokio::test(start_paused = true)]
async fn test_environment_poll_times_out() {
    let cloud = Arc::new(
        ScriptedCloud::new().with_environment_statuses(vec![EnvironmentStatus::Creating]),
    );
    let timing = TimingConfig {
        settle_delay_secs: 1,
        poll_interval_secs: 5,
        instance_timeout_secs: 60,
        environment_timeout_secs: 30,
    };

    let err = provisioner(&cloud, demo_config().with_timing(timing))
        .provision()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Timeout {
            waiting_for: "environment ready",
            ..
        }
    ));
    assert_eq!(cloud.count(Step::SendCommand), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_settle_delay() {
    let cloud = Arc::new(ScriptedCloud::new());
    let provisioner = provisioner(&cloud, demo_config());
    let (handle, signal) = cancellation();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.cancel();
    });

    let report = provisioner.run(signal).await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::Cancelled {
            during: ProvisionState::InstanceDiscovering
        })
    ));
    assert_eq!(cloud.count(Step::DescribeInstances), 0);
    assert_eq!(report.final_state().name(), "FAILED");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_makes_no_calls() {
    let cloud = Arc::new(ScriptedCloud::new());
    let (handle, signal) = cancellation();
    handle.cancel();

    let report = provisioner(&cloud, demo_config()).run(signal).await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::Cancelled {
            during: ProvisionState::Init
        })
    ));
    assert!(cloud.calls().is_empty());
    assert_eq!(state_names(&report.states), vec!["INIT", "FAILED"]);
}

fn slow_backoff() -> RetryConfig {
    RetryConfig {
        max_attempts: 10,
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        backoff_multiplier: 1.0,
        jitter: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_retry_backoff() {
    let cloud = Arc::new(
        ScriptedCloud::new().fail_always(Step::CreateRole, ApiError::transient("Rate exceeded")),
    );
    let provisioner = provisioner(&cloud, demo_config().with_retry(slow_backoff()));
    let (handle, signal) = cancellation();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.cancel();
    });

    let started = tokio::time::Instant::now();
    let report = provisioner.run(signal).await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::Cancelled {
            during: ProvisionState::EnvCreated
        })
    ));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(cloud.count(Step::CreateRole), 1);
    assert_eq!(cloud.count(Step::AttachManagedPolicy), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_backoff_inside_environment_poll() {
    let cloud = Arc::new(ScriptedCloud::new().fail_always(
        Step::DescribeEnvironment,
        ApiError::transient("Rate exceeded").with_code("ThrottlingException"),
    ));
    let timing = TimingConfig {
        settle_delay_secs: 30,
        poll_interval_secs: 5,
        instance_timeout_secs: 60,
        environment_timeout_secs: 3600,
    };
    let provisioner = provisioner(
        &cloud,
        demo_config().with_timing(timing).with_retry(slow_backoff()),
    );
    let (handle, signal) = cancellation();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(40)).await;
        handle.cancel();
    });

    let started = tokio::time::Instant::now();
    let report = provisioner.run(signal).await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::Cancelled {
            during: ProvisionState::EnvValidating
        })
    ));
    assert!(started.elapsed() < Duration::from_secs(90));
    assert_eq!(cloud.count(Step::DescribeEnvironment), 1);
    assert_eq!(cloud.count(Step::SendCommand), 0);
}

#[tokio::test(start_paused = true)]
async fn test_environment_poll_bounded_while_throttled() {
    let cloud = Arc::new(ScriptedCloud::new().fail_always(
        Step::DescribeEnvironment,
        ApiError::transient("Rate exceeded").with_code("ThrottlingException"),
    ));
    let timing = TimingConfig {
        settle_delay_secs: 30,
        poll_interval_secs: 5,
        instance_timeout_secs: 60,
        environment_timeout_secs: 20,
    };

    let started = tokio::time::Instant::now();
    let err = provisioner(&cloud, demo_config().with_timing(timing))
        .provision()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Timeout {
            waiting_for: "environment ready",
            ..
        }
    ));
    // settle delay plus the poll bound, not the full retry budget
    assert!(started.elapsed() <= Duration::from_secs(51));
    assert_eq!(cloud.count(Step::SendCommand), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_is_retried() {
    let cloud = Arc::new(
        ScriptedCloud::new()
            .fail_next(
                Step::CreateRole,
                ApiError::transient("Rate exceeded").with_code("Throttling"),
            )
            .fail_next(
                Step::CreateRole,
                ApiError::transient("Rate exceeded").with_code("Throttling"),
            ),
    );

    provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("retries absorb throttling");

    assert_eq!(cloud.count(Step::CreateRole), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let cloud = Arc::new(
        ScriptedCloud::new().fail_always(Step::DescribeInstances, ApiError::transient("busy")),
    );
    let retry = RetryConfig {
        max_attempts: 3,
        ..RetryConfig::default()
    };

    let err = provisioner(&cloud, demo_config().with_retry(retry))
        .provision()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Provisioning {
            step: Step::DescribeInstances,
            ..
        }
    ));
    assert_eq!(cloud.count(Step::DescribeInstances), 3);
}

#[tokio::test(start_paused = true)]
async fn test_already_associated_counts_as_success() {
    let cloud = Arc::new(ScriptedCloud::new().with_association(Association::AlreadyAssociated));

    let outcome = provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("existing association is accepted");

    assert_eq!(outcome.instance_id.as_str(), "i-1");
    assert_eq!(cloud.count(Step::SendCommand), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_instance_is_skipped() {
    let cloud = Arc::new(ScriptedCloud::new().with_instance_lookups(vec![vec![
        InstanceSummary::new("i-old", InstanceState::Terminated),
        running("i-new"),
    ]]));

    let outcome = provisioner(&cloud, demo_config())
        .provision()
        .await
        .expect("provisioning succeeds");

    assert_eq!(outcome.instance_id.as_str(), "i-new");
}

#[tokio::test(start_paused = true)]
async fn test_derived_name_discovery_uses_environment_id() {
    let cloud = Arc::new(ScriptedCloud::new().with_environment_id("e-77"));

    provisioner(
        &cloud,
        demo_config().with_discovery(DiscoveryMode::DerivedName),
    )
    .provision()
    .await
    .expect("provisioning succeeds");

    let filter = cloud
        .calls()
        .into_iter()
        .find_map(|c| match c {
            ApiCall::DescribeInstances(filter) => Some(filter),
            _ => None,
        })
        .expect("instances were described");
    assert_eq!(filter.to_string(), "tag:Name=aws-cloud9-demo-e-77");
}
