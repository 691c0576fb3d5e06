//! In-memory fake of the Cloud Provisioning API (testing only)
//!
//! `ScriptedCloud` implements every capability trait, answers from a script
//! and records each call in order, so tests can assert on call sequences
//! without talking to AWS.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::api::*;
use crate::error::{ApiError, Step};

/// One recorded call against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    CreateEnvironment(EnvironmentRequest),
    DescribeEnvironment {
        environment_id: String,
    },
    CreateRole {
        role_name: String,
        trust_policy: String,
    },
    AttachManagedPolicy {
        role_name: String,
        policy_arn: String,
    },
    CreateInstanceProfile {
        profile_name: String,
    },
    AddRoleToInstanceProfile {
        profile_name: String,
        role_name: String,
    },
    DescribeInstances(InstanceFilter),
    AssociateInstanceProfile {
        profile_name: String,
        instance_id: String,
    },
    SendCommand(BootstrapCommand),
}

impl ApiCall {
    pub fn step(&self) -> Step {
        match self {
            ApiCall::CreateEnvironment(_) => Step::CreateEnvironment,
            ApiCall::DescribeEnvironment { .. } => Step::DescribeEnvironment,
            ApiCall::CreateRole { .. } => Step::CreateRole,
            ApiCall::AttachManagedPolicy { .. } => Step::AttachManagedPolicy,
            ApiCall::CreateInstanceProfile { .. } => Step::CreateInstanceProfile,
            ApiCall::AddRoleToInstanceProfile { .. } => Step::AddRoleToInstanceProfile,
            ApiCall::DescribeInstances(_) => Step::DescribeInstances,
            ApiCall::AssociateInstanceProfile { .. } => Step::AssociateInstanceProfile,
            ApiCall::SendCommand(_) => Step::SendCommand,
        }
    }
}

/// A response script: entries are consumed in order and the last one repeats.
#[derive(Debug)]
struct Script<T>(VecDeque<T>);

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        Script(items.into())
    }

    fn next(&mut self) -> Option<T> {
        if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        }
    }
}

/// Scripted, call-recording fake of every Cloud Provisioning API capability.
#[derive(Debug)]
pub struct ScriptedCloud {
    environment_id: Mutex<String>,
    environment_script: Mutex<Script<EnvironmentDescription>>,
    instance_script: Mutex<Script<Vec<InstanceSummary>>>,
    association: Mutex<Association>,
    command_id: Mutex<String>,
    one_shot_failures: Mutex<HashMap<Step, VecDeque<ApiError>>>,
    permanent_failures: Mutex<HashMap<Step, ApiError>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl Default for ScriptedCloud {
    /// Everything succeeds immediately: environment `e-1` is `CREATED`,
    /// instance `i-1` is `running`.
    fn default() -> Self {
        Self {
            environment_id: Mutex::new("e-1".to_string()),
            environment_script: Mutex::new(Script::new(vec![EnvironmentDescription::new(
                EnvironmentStatus::Created,
            )])),
            instance_script: Mutex::new(Script::new(vec![vec![InstanceSummary::new(
                "i-1",
                InstanceState::Running,
            )]])),
            association: Mutex::new(Association::Associated),
            command_id: Mutex::new("cmd-1".to_string()),
            one_shot_failures: Mutex::new(HashMap::new()),
            permanent_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment_id(self, id: &str) -> Self {
        *self.environment_id.lock().unwrap() = id.to_string();
        self
    }

    /// Statuses returned by successive describe calls.
    pub fn with_environment_statuses(self, statuses: Vec<EnvironmentStatus>) -> Self {
        let descriptions = statuses.into_iter().map(EnvironmentDescription::new).collect();
        self.with_environment_descriptions(descriptions)
    }

    pub fn with_environment_descriptions(self, descriptions: Vec<EnvironmentDescription>) -> Self {
        *self.environment_script.lock().unwrap() = Script::new(descriptions);
        self
    }

    /// Results of successive instance lookups.
    pub fn with_instance_lookups(self, lookups: Vec<Vec<InstanceSummary>>) -> Self {
        *self.instance_script.lock().unwrap() = Script::new(lookups);
        self
    }

    pub fn with_association(self, association: Association) -> Self {
        *self.association.lock().unwrap() = association;
        self
    }

    pub fn with_command_id(self, id: &str) -> Self {
        *self.command_id.lock().unwrap() = id.to_string();
        self
    }

    /// Fail the next call to `step` with `error`. Queues when called again.
    pub fn fail_next(self, step: Step, error: ApiError) -> Self {
        self.one_shot_failures
            .lock()
            .unwrap()
            .entry(step)
            .or_default()
            .push_back(error);
        self
    }

    /// Fail every call to `step` with `error`.
    pub fn fail_always(self, step: Step, error: ApiError) -> Self {
        self.permanent_failures.lock().unwrap().insert(step, error);
        self
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<Step> {
        self.calls().iter().map(ApiCall::step).collect()
    }

    pub fn count(&self, step: Step) -> usize {
        self.calls().iter().filter(|c| c.step() == step).count()
    }

    fn record(&self, call: ApiCall) -> ApiResult<()> {
        let step = call.step();
        self.calls.lock().unwrap().push(call);

        if let Some(err) = self
            .one_shot_failures
            .lock()
            .unwrap()
            .get_mut(&step)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if let Some(err) = self.permanent_failures.lock().unwrap().get(&step) {
            return Err(err.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl EnvironmentApi for ScriptedCloud {
    async fn create_environment(&self, request: &EnvironmentRequest) -> ApiResult<EnvironmentId> {
        self.record(ApiCall::CreateEnvironment(request.clone()))?;
        Ok(EnvironmentId::new(self.environment_id.lock().unwrap().clone()))
    }

    async fn describe_environment(&self, id: &EnvironmentId) -> ApiResult<EnvironmentDescription> {
        self.record(ApiCall::DescribeEnvironment {
            environment_id: id.to_string(),
        })?;
        self.environment_script
            .lock()
            .unwrap()
            .next()
            .ok_or_else(|| ApiError::new(crate::error::ApiErrorKind::NotFound, "no such environment"))
    }
}

#[async_trait]
impl IdentityApi for ScriptedCloud {
    async fn create_role(&self, role_name: &str, trust_policy: &str) -> ApiResult<()> {
        self.record(ApiCall::CreateRole {
            role_name: role_name.to_string(),
            trust_policy: trust_policy.to_string(),
        })
    }

    async fn attach_managed_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()> {
        self.record(ApiCall::AttachManagedPolicy {
            role_name: role_name.to_string(),
            policy_arn: policy_arn.to_string(),
        })
    }

    async fn create_instance_profile(&self, profile_name: &str) -> ApiResult<()> {
        self.record(ApiCall::CreateInstanceProfile {
            profile_name: profile_name.to_string(),
        })
    }

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()> {
        self.record(ApiCall::AddRoleToInstanceProfile {
            profile_name: profile_name.to_string(),
            role_name: role_name.to_string(),
        })
    }
}

#[async_trait]
impl ComputeApi for ScriptedCloud {
    async fn describe_instances(&self, filter: &InstanceFilter) -> ApiResult<Vec<InstanceSummary>> {
        self.record(ApiCall::DescribeInstances(filter.clone()))?;
        Ok(self.instance_script.lock().unwrap().next().unwrap_or_default())
    }

    async fn associate_instance_profile(
        &self,
        profile_name: &str,
        instance_id: &InstanceId,
    ) -> ApiResult<Association> {
        self.record(ApiCall::AssociateInstanceProfile {
            profile_name: profile_name.to_string(),
            instance_id: instance_id.to_string(),
        })?;
        Ok(*self.association.lock().unwrap())
    }
}

#[async_trait]
impl RemoteExecApi for ScriptedCloud {
    async fn send_command(&self, command: &BootstrapCommand) -> ApiResult<CommandId> {
        self.record(ApiCall::SendCommand(command.clone()))?;
        Ok(CommandId::new(self.command_id.lock().unwrap().clone()))
    }
}
