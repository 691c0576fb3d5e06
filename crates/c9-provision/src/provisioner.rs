//! The provisioning workflow.
//!
//! One run walks a strict dependency chain against the Cloud Provisioning
//! API: environment → role/profile → instance discovery → running poll →
//! profile attach → environment-ready poll → bootstrap dispatch. Each step
//! only starts once the identifiers it needs are known, and the first
//! failure ends the run. Nothing is rolled back.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::api::{
    Association, BootstrapCommand, CloudApi, CommandId, EnvironmentId, EnvironmentRequest,
    EnvironmentStatus, InstanceFilter, InstanceId, InstanceState, InstanceSummary,
};
use crate::config::{DiscoveryMode, ProvisionConfig};
use crate::error::{ApiError, ProvisionError, Step};
use crate::identity::{assume_role_policy, derived_instance_name};
use crate::obs::{
    emit_run_failed, emit_run_finished, emit_run_started, emit_step_finished, emit_step_started,
    provision_span,
};
use crate::poll::{poll_until, CancelSignal, PollConfig, PollStep};
use crate::retry::with_retry;
use crate::state::{ProvisionState, StateTracker, StateTransition};
use crate::Result;

/// Identifiers and final observations of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    pub environment_id: EnvironmentId,
    pub instance_id: InstanceId,
    pub command_id: CommandId,
    /// Last observed environment status; always `Created`.
    pub environment_status: EnvironmentStatus,
    /// Last observed instance state; always `Running`.
    pub instance_state: InstanceState,
}

/// Everything known about a finished run, successful or not.
#[derive(Debug)]
pub struct ProvisionReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub states: Vec<StateTransition>,
    pub result: Result<ProvisionOutcome>,
}

impl ProvisionReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// The terminal state the run ended in.
    pub fn final_state(&self) -> &ProvisionState {
        self.states
            .last()
            .map(|t| &t.state)
            .unwrap_or(&ProvisionState::Init)
    }

    pub fn into_result(self) -> Result<ProvisionOutcome> {
        self.result
    }
}

/// Runs the provisioning workflow against a [`CloudApi`] backend.
pub struct Provisioner {
    api: Arc<dyn CloudApi>,
    config: ProvisionConfig,
}

impl Provisioner {
    /// Create a provisioner; the configuration is validated here, once.
    pub fn new(api: Arc<dyn CloudApi>, config: ProvisionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { api, config })
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Run the workflow to completion without a cancel hook.
    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        self.run(CancelSignal::never()).await.into_result()
    }

    /// Run the workflow once, returning the outcome and the state history.
    pub async fn run(&self, mut cancel: CancelSignal) -> ProvisionReport {
        let run_id = Uuid::new_v4().to_string();
        let span = provision_span(&run_id, &self.config.environment.name);
        let started_at = Utc::now();
        let started = Instant::now();

        emit_run_started(&run_id, &self.config.environment.name, &self.config.region);

        let mut tracker = StateTracker::new(run_id.clone());
        let result = self
            .execute(&mut tracker, &mut cancel)
            .instrument(span)
            .await;

        if let Err(err) = &result {
            emit_run_failed(&run_id, err.kind(), err);
            tracker.fail(err.to_string());
        }
        emit_run_finished(
            &run_id,
            started.elapsed().as_millis() as u64,
            tracker.current(),
        );

        ProvisionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            states: tracker.into_history(),
            result,
        }
    }

    async fn execute(
        &self,
        tracker: &mut StateTracker,
        cancel: &mut CancelSignal,
    ) -> Result<ProvisionOutcome> {
        let timing = &self.config.timing;

        check_cancel(cancel, tracker)?;
        tracker.advance(ProvisionState::EnvCreating);
        let environment_id = self.create_environment(cancel, tracker.current()).await?;
        tracker.advance(ProvisionState::EnvCreated);

        check_cancel(cancel, tracker)?;
        self.setup_identity(cancel, tracker.current()).await?;

        tracker.advance(ProvisionState::InstanceDiscovering);
        info!(delay_secs = timing.settle_delay_secs, "waiting for instance to become visible");
        cancel.sleep(timing.settle_delay(), tracker.current()).await?;

        let filter = self.instance_filter(&environment_id);
        let discovered = self
            .locate_instance(&filter, None, cancel, tracker.current())
            .await?;
        info!(instance_id = %discovered.id, state = %discovered.state, "instance discovered");

        let instance = if discovered.state.is_pending() {
            tracker.advance(ProvisionState::InstancePending);
            self.wait_for_running(&filter, &discovered.id, tracker, cancel)
                .await?
        } else {
            discovered
        };
        if !instance.state.is_running() {
            return Err(ProvisionError::UnexpectedState {
                instance_id: instance.id.to_string(),
                state: instance.state.to_string(),
            });
        }
        tracker.advance(ProvisionState::InstanceRunning);

        check_cancel(cancel, tracker)?;
        self.attach_profile(&instance.id, cancel, tracker.current())
            .await?;
        tracker.advance(ProvisionState::ProfileAttached);

        tracker.advance(ProvisionState::EnvValidating);
        let environment_status = self
            .wait_for_environment(&environment_id, tracker.current(), cancel)
            .await?;
        tracker.advance(ProvisionState::EnvReady);

        check_cancel(cancel, tracker)?;
        let command_id = self
            .dispatch_bootstrap(&instance.id, cancel, tracker.current())
            .await?;
        tracker.advance(ProvisionState::BootstrapDispatched);

        Ok(ProvisionOutcome {
            environment_id,
            instance_id: instance.id,
            command_id,
            environment_status,
            instance_state: instance.state,
        })
    }

    /// Call the API for `step`, retrying transient errors until `cancel` fires.
    async fn call<T, F, Fut>(
        &self,
        step: Step,
        cancel: &CancelSignal,
        during: &ProvisionState,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ApiError>>,
    {
        emit_step_started(step);
        with_retry(&self.config.retry, step, cancel, during, operation).await
    }

    #[instrument(skip(self, cancel))]
    async fn create_environment(
        &self,
        cancel: &CancelSignal,
        during: &ProvisionState,
    ) -> Result<EnvironmentId> {
        let env = &self.config.environment;
        let request = EnvironmentRequest {
            name: env.name.clone(),
            description: env.description.clone(),
            instance_type: env.instance_type.clone(),
            image_id: env.image_id.clone(),
            tags: vec![env.tag.clone()],
        };

        let api = self.api.as_ref();
        let id = self
            .call(Step::CreateEnvironment, cancel, during, || {
                api.create_environment(&request)
            })
            .await?;
        emit_step_finished(Step::CreateEnvironment, id.as_str());
        Ok(id)
    }

    /// Role, managed policy, instance profile, role-to-profile link.
    #[instrument(skip(self, cancel))]
    async fn setup_identity(&self, cancel: &CancelSignal, during: &ProvisionState) -> Result<()> {
        let identity = &self.config.identity;
        let role = identity.role_name.as_str();
        let profile = identity.profile_name.as_str();
        let trust_policy = assume_role_policy(&identity.trusted_service).to_string();
        let api = self.api.as_ref();

        self.call(Step::CreateRole, cancel, during, || {
            api.create_role(role, &trust_policy)
        })
        .await?;
        emit_step_finished(Step::CreateRole, role);

        self.call(Step::AttachManagedPolicy, cancel, during, || {
            api.attach_managed_policy(role, &identity.managed_policy_arn)
        })
        .await?;
        emit_step_finished(Step::AttachManagedPolicy, &identity.managed_policy_arn);

        self.call(Step::CreateInstanceProfile, cancel, during, || {
            api.create_instance_profile(profile)
        })
        .await?;
        emit_step_finished(Step::CreateInstanceProfile, profile);

        self.call(Step::AddRoleToInstanceProfile, cancel, during, || {
            api.add_role_to_instance_profile(profile, role)
        })
        .await?;
        emit_step_finished(Step::AddRoleToInstanceProfile, profile);

        Ok(())
    }

    fn instance_filter(&self, environment_id: &EnvironmentId) -> InstanceFilter {
        match self.config.discovery {
            DiscoveryMode::Tag => {
                let tag = &self.config.environment.tag;
                InstanceFilter::tag(&tag.key, tag.value.clone())
            }
            DiscoveryMode::DerivedName => InstanceFilter::tag(
                "Name",
                derived_instance_name(&self.config.environment.name, environment_id.as_str()),
            ),
        }
    }

    /// One lookup. Prefers `previous` when it is still listed, then the
    /// first instance that is not terminated, then the first instance.
    async fn locate_instance(
        &self,
        filter: &InstanceFilter,
        previous: Option<&InstanceId>,
        cancel: &CancelSignal,
        during: &ProvisionState,
    ) -> Result<InstanceSummary> {
        let api = self.api.as_ref();
        let mut instances = self
            .call(Step::DescribeInstances, cancel, during, || {
                api.describe_instances(filter)
            })
            .await?;

        if instances.len() > 1 {
            warn!(filter = %filter, count = instances.len(), "lookup matched several instances");
        }

        let index = previous
            .and_then(|id| instances.iter().position(|i| &i.id == id))
            .or_else(|| instances.iter().position(|i| !i.state.is_gone()))
            .or(if instances.is_empty() { None } else { Some(0) });

        match index {
            Some(index) => Ok(instances.swap_remove(index)),
            None => Err(ProvisionError::InstanceNotFound {
                filter: filter.to_string(),
            }),
        }
    }

    /// Re-query until the instance leaves `pending`.
    async fn wait_for_running(
        &self,
        filter: &InstanceFilter,
        instance_id: &InstanceId,
        tracker: &StateTracker,
        cancel: &mut CancelSignal,
    ) -> Result<InstanceSummary> {
        let timing = &self.config.timing;
        let poll = PollConfig::new(timing.poll_interval(), timing.instance_timeout());
        let during = tracker.current();

        // the discovery lookup was the first observation
        cancel.sleep(poll.interval, during).await?;

        let call_cancel = &cancel.clone();
        poll_until(poll, "instance running", during, cancel, move || async move {
            let instance = self
                .locate_instance(filter, Some(instance_id), call_cancel, during)
                .await?;
            if instance.state.is_pending() {
                Ok(PollStep::Pending(instance.state.to_string()))
            } else {
                Ok(PollStep::Done(instance))
            }
        })
        .await
    }

    #[instrument(skip(self, cancel))]
    async fn attach_profile(
        &self,
        instance_id: &InstanceId,
        cancel: &CancelSignal,
        during: &ProvisionState,
    ) -> Result<Association> {
        let profile = self.config.identity.profile_name.as_str();
        let api = self.api.as_ref();

        let association = self
            .call(Step::AssociateInstanceProfile, cancel, during, || {
                api.associate_instance_profile(profile, instance_id)
            })
            .await?;

        if association == Association::AlreadyAssociated {
            info!(instance_id = %instance_id, profile = %profile, "instance profile already associated");
        }
        emit_step_finished(Step::AssociateInstanceProfile, profile);
        Ok(association)
    }

    /// Re-query until the environment leaves `CREATING`.
    async fn wait_for_environment(
        &self,
        environment_id: &EnvironmentId,
        during: &ProvisionState,
        cancel: &mut CancelSignal,
    ) -> Result<EnvironmentStatus> {
        let timing = &self.config.timing;
        let poll = PollConfig::new(timing.poll_interval(), timing.environment_timeout());
        let api = self.api.as_ref();

        let call_cancel = &cancel.clone();
        let description = poll_until(poll, "environment ready", during, cancel, move || async move {
            let description = self
                .call(Step::DescribeEnvironment, call_cancel, during, || {
                    api.describe_environment(environment_id)
                })
                .await?;
            if description.status.is_creating() {
                Ok(PollStep::Pending(description.status.to_string()))
            } else {
                Ok(PollStep::Done(description))
            }
        })
        .await?;

        if !description.status.is_ready() {
            return Err(ProvisionError::EnvironmentFailed {
                environment_id: environment_id.to_string(),
                status: description.status.to_string(),
                reason: description.reason,
            });
        }
        emit_step_finished(Step::DescribeEnvironment, description.status.as_str());
        Ok(description.status)
    }

    /// Fire-and-forget: the command id is returned, completion is not tracked.
    #[instrument(skip(self, cancel))]
    async fn dispatch_bootstrap(
        &self,
        instance_id: &InstanceId,
        cancel: &CancelSignal,
        during: &ProvisionState,
    ) -> Result<CommandId> {
        let bootstrap = &self.config.bootstrap;
        let command = BootstrapCommand {
            instance_id: instance_id.clone(),
            document_name: bootstrap.document_name.clone(),
            working_directory: bootstrap.working_directory.clone(),
            commands: bootstrap.commands.clone(),
        };
        let api = self.api.as_ref();

        let command_id = self
            .call(Step::SendCommand, cancel, during, || api.send_command(&command))
            .await?;
        emit_step_finished(Step::SendCommand, command_id.as_str());
        Ok(command_id)
    }
}

fn check_cancel(cancel: &CancelSignal, tracker: &StateTracker) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled {
            during: tracker.current().clone(),
        });
    }
    Ok(())
}
