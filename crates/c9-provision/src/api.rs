//! Cloud Provisioning API trait definitions
//!
//! The provisioner consumes four capability groups:
//! - `EnvironmentApi`: Cloud9 environment create/describe
//! - `IdentityApi`: IAM role and instance profile setup
//! - `ComputeApi`: EC2 instance lookup and profile association
//! - `RemoteExecApi`: SSM command dispatch
//!
//! All traits are async and backend-agnostic. [`crate::aws_cli::AwsCliBackend`]
//! talks to AWS; [`crate::fakes::ScriptedCloud`] is an in-memory stand-in
//! for tests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Result type for Cloud Provisioning API calls
pub type ApiResult<T> = std::result::Result<T, ApiError>;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(
    /// Cloud9 environment identifier.
    EnvironmentId
);
id_newtype!(
    /// EC2 instance identifier.
    InstanceId
);
id_newtype!(
    /// SSM command identifier.
    CommandId
);

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Key/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Parameters for creating an EC2-backed Cloud9 environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRequest {
    pub name: String,
    pub description: String,
    pub instance_type: String,
    pub image_id: Option<String>,
    pub tags: Vec<Tag>,
}

/// Cloud9 environment lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentStatus {
    Creating,
    Created,
    CreateFailed,
    Deleting,
    DeleteFailed,
    Other(String),
}

impl EnvironmentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATING" => EnvironmentStatus::Creating,
            "CREATED" => EnvironmentStatus::Created,
            "CREATE_FAILED" => EnvironmentStatus::CreateFailed,
            "DELETING" => EnvironmentStatus::Deleting,
            "DELETE_FAILED" => EnvironmentStatus::DeleteFailed,
            other => EnvironmentStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EnvironmentStatus::Creating => "CREATING",
            EnvironmentStatus::Created => "CREATED",
            EnvironmentStatus::CreateFailed => "CREATE_FAILED",
            EnvironmentStatus::Deleting => "DELETING",
            EnvironmentStatus::DeleteFailed => "DELETE_FAILED",
            EnvironmentStatus::Other(raw) => raw,
        }
    }

    pub fn is_creating(&self) -> bool {
        *self == EnvironmentStatus::Creating
    }

    pub fn is_ready(&self) -> bool {
        *self == EnvironmentStatus::Created
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of describing an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescription {
    pub status: EnvironmentStatus,
    /// Lifecycle reason reported alongside failure statuses.
    pub reason: Option<String>,
}

impl EnvironmentDescription {
    pub fn new(status: EnvironmentStatus) -> Self {
        Self {
            status,
            reason: None,
        }
    }
}

#[async_trait]
pub trait EnvironmentApi: Send + Sync {
    /// Create an environment and return its id.
    async fn create_environment(&self, request: &EnvironmentRequest) -> ApiResult<EnvironmentId>;

    /// Read the current lifecycle status of an environment.
    async fn describe_environment(&self, id: &EnvironmentId) -> ApiResult<EnvironmentDescription>;
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Create a role with the given trust policy document (JSON).
    async fn create_role(&self, role_name: &str, trust_policy: &str) -> ApiResult<()>;

    async fn attach_managed_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()>;

    async fn create_instance_profile(&self, profile_name: &str) -> ApiResult<()>;

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()>;
}

// ---------------------------------------------------------------------------
// Compute
// ---------------------------------------------------------------------------

/// EC2 instance state name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Other(String),
}

impl InstanceState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            other => InstanceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Other(raw) => raw,
        }
    }

    pub fn is_pending(&self) -> bool {
        *self == InstanceState::Pending
    }

    pub fn is_running(&self) -> bool {
        *self == InstanceState::Running
    }

    /// Terminated or on its way there; such instances are leftovers.
    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::ShuttingDown)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance returned by a describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub state: InstanceState,
    pub tags: BTreeMap<String, String>,
}

impl InstanceSummary {
    pub fn new(id: impl Into<String>, state: InstanceState) -> Self {
        Self {
            id: InstanceId::new(id),
            state,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// EC2 describe filter, e.g. `tag:Env = [demo-E]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    pub name: String,
    pub values: Vec<String>,
}

impl InstanceFilter {
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self {
            name: format!("tag:{key}"),
            values: vec![value.into()],
        }
    }
}

impl fmt::Display for InstanceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.values.join(","))
    }
}

/// Outcome of attaching an instance profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    Associated,
    /// The instance already had an association; treated as success.
    AlreadyAssociated,
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn describe_instances(&self, filter: &InstanceFilter) -> ApiResult<Vec<InstanceSummary>>;

    async fn associate_instance_profile(
        &self,
        profile_name: &str,
        instance_id: &InstanceId,
    ) -> ApiResult<Association>;
}

// ---------------------------------------------------------------------------
// Remote execution
// ---------------------------------------------------------------------------

/// Shell commands to run on an instance through its remote-execution agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapCommand {
    pub instance_id: InstanceId,
    pub document_name: String,
    pub working_directory: String,
    pub commands: Vec<String>,
}

impl BootstrapCommand {
    /// Parameters document in the shape the run-shell-script document expects.
    pub fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "workingDirectory": [&self.working_directory],
            "commands": &self.commands,
        })
    }
}

#[async_trait]
pub trait RemoteExecApi: Send + Sync {
    /// Dispatch a command; returns as soon as the service accepted it.
    async fn send_command(&self, command: &BootstrapCommand) -> ApiResult<CommandId>;
}

/// Everything the provisioner needs from a cloud backend.
pub trait CloudApi: EnvironmentApi + IdentityApi + ComputeApi + RemoteExecApi {}

impl<T> CloudApi for T where T: EnvironmentApi + IdentityApi + ComputeApi + RemoteExecApi {}
