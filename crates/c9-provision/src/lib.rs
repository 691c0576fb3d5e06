//! c9-provision: Cloud9 IDE environment provisioning
//!
//! Creates a Cloud9 EC2 environment, gives its instance an administrator
//! instance profile and dispatches a bootstrap script over SSM.
//!
//! The workflow in [`provisioner`] only talks to the capability traits in
//! [`api`]; [`aws_cli::AwsCliBackend`] implements them against AWS and
//! [`fakes::ScriptedCloud`] implements them in memory for tests.

pub mod api;
pub mod aws_cli;
pub mod config;
pub mod error;
pub mod fakes;
pub mod identity;
pub mod obs;
pub mod poll;
pub mod provisioner;
pub mod retry;
pub mod state;
pub mod telemetry;

pub use api::{
    Association, BootstrapCommand, CloudApi, CommandId, ComputeApi, EnvironmentApi,
    EnvironmentDescription, EnvironmentId, EnvironmentRequest, EnvironmentStatus, IdentityApi,
    InstanceFilter, InstanceId, InstanceState, InstanceSummary, RemoteExecApi, Tag,
};
pub use aws_cli::{AwsCliBackend, AwsCliConfig};
pub use config::{
    BootstrapConfig, DiscoveryMode, EnvironmentConfig, IdentityConfig, ProvisionConfig,
    TimingConfig,
};
pub use error::{ApiError, ApiErrorKind, ConfigError, ProvisionError, Step};
pub use identity::{assume_role_policy, derived_instance_name, EC2_SERVICE_PRINCIPAL};
pub use poll::{cancellation, CancelHandle, CancelSignal};
pub use provisioner::{ProvisionOutcome, ProvisionReport, Provisioner};
pub use retry::RetryConfig;
pub use state::{ProvisionState, StateTracker, StateTransition};

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
