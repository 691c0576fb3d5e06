//! Error types for c9-provision

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::state::ProvisionState;

/// How a failed cloud API call should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Throttling, service unavailable, request timeout. Safe to retry.
    Transient,
    /// The named entity already exists.
    AlreadyExists,
    /// The referenced entity does not exist.
    NotFound,
    /// Any other rejection by the service or the client.
    Rejected,
}

/// Error returned by a Cloud Provisioning API call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}{message}", .code.as_ref().map(|c| format!("{c}: ")).unwrap_or_default())]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// Service error code (e.g. `ThrottlingException`), when known.
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transient, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Rejected, message)
    }

    /// The client gave up waiting for a response. The request may still
    /// have been applied by the service.
    pub fn client_timeout(message: impl Into<String>) -> Self {
        Self::transient(message).with_code(CLIENT_TIMEOUT_CODE)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ApiErrorKind::Transient
    }

    pub fn is_client_timeout(&self) -> bool {
        self.code.as_deref() == Some(CLIENT_TIMEOUT_CODE)
    }
}

/// Code carried by [`ApiError::client_timeout`].
pub const CLIENT_TIMEOUT_CODE: &str = "ClientTimeout";

/// The external call a [`ProvisionError::Provisioning`] failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateEnvironment,
    DescribeEnvironment,
    CreateRole,
    AttachManagedPolicy,
    CreateInstanceProfile,
    AddRoleToInstanceProfile,
    DescribeInstances,
    AssociateInstanceProfile,
    SendCommand,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::CreateEnvironment => "create_environment",
            Step::DescribeEnvironment => "describe_environment",
            Step::CreateRole => "create_role",
            Step::AttachManagedPolicy => "attach_managed_policy",
            Step::CreateInstanceProfile => "create_instance_profile",
            Step::AddRoleToInstanceProfile => "add_role_to_instance_profile",
            Step::DescribeInstances => "describe_instances",
            Step::AssociateInstanceProfile => "associate_instance_profile",
            Step::SendCommand => "send_command",
        }
    }

    /// Whether repeating an already-applied call is harmless.
    ///
    /// Creates and command dispatch are not: a repeat either fails with
    /// "already exists" or runs the bootstrap twice.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Step::CreateEnvironment
                | Step::CreateRole
                | Step::CreateInstanceProfile
                | Step::AddRoleToInstanceProfile
                | Step::SendCommand
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by a provisioning run.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A create/attach/describe/send call failed.
    #[error("{step} failed: {source}")]
    Provisioning {
        step: Step,
        #[source]
        source: ApiError,
    },

    /// The instance lookup after the settling delay returned nothing.
    #[error("no instance found matching {filter}")]
    InstanceNotFound { filter: String },

    /// The instance left `pending` for a state other than `running`.
    #[error("instance {instance_id} reached unexpected state {state}")]
    UnexpectedState { instance_id: String, state: String },

    /// The environment lifecycle reported an error status.
    #[error("environment {environment_id} failed with status {status}{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    EnvironmentFailed {
        environment_id: String,
        status: String,
        reason: Option<String>,
    },

    /// A poll loop exceeded its bound.
    #[error("timed out after {waited:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        waited: Duration,
    },

    /// The run was cancelled by its caller.
    #[error("provisioning cancelled during {during}")]
    Cancelled { during: ProvisionState },

    /// Configuration rejected at the boundary.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProvisionError {
    pub fn provisioning(step: Step, source: ApiError) -> Self {
        ProvisionError::Provisioning { step, source }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Provisioning { .. } => "provisioning_error",
            ProvisionError::InstanceNotFound { .. } => "instance_not_found",
            ProvisionError::UnexpectedState { .. } => "unexpected_state",
            ProvisionError::EnvironmentFailed { .. } => "environment_failed",
            ProvisionError::Timeout { .. } => "provisioning_timeout",
            ProvisionError::Cancelled { .. } => "cancelled",
            ProvisionError::InvalidConfig(_) => "invalid_config",
        }
    }
}

/// Errors raised while loading configuration from disk.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] ProvisionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display_includes_code() {
        let err = ApiError::transient("Rate exceeded").with_code("ThrottlingException");
        assert_eq!(err.to_string(), "ThrottlingException: Rate exceeded");
        assert!(err.is_transient());
    }

    #[test]
    fn test_api_error_display_without_code() {
        let err = ApiError::rejected("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_client_timeout_is_transient_and_marked() {
        let err = ApiError::client_timeout("no response within 120s");
        assert!(err.is_transient());
        assert!(err.is_client_timeout());
        assert!(!ApiError::transient("Rate exceeded").is_client_timeout());
    }

    #[test]
    fn test_create_steps_are_not_idempotent() {
        assert!(!Step::CreateEnvironment.is_idempotent());
        assert!(!Step::CreateRole.is_idempotent());
        assert!(!Step::SendCommand.is_idempotent());
        assert!(Step::DescribeInstances.is_idempotent());
        assert!(Step::AttachManagedPolicy.is_idempotent());
    }

    #[test]
    fn test_provisioning_error_names_step() {
        let err = ProvisionError::provisioning(Step::CreateRole, ApiError::rejected("denied"));
        assert_eq!(err.to_string(), "create_role failed: denied");
        assert_eq!(err.kind(), "provisioning_error");
    }

    #[test]
    fn test_environment_failed_display_with_reason() {
        let err = ProvisionError::EnvironmentFailed {
            environment_id: "e-1".to_string(),
            status: "CREATE_FAILED".to_string(),
            reason: Some("subnet has no route".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "environment e-1 failed with status CREATE_FAILED: subnet has no route"
        );
    }
}
