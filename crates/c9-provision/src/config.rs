//! Provisioning configuration
//!
//! A [`ProvisionConfig`] names everything one run creates. Defaults reproduce
//! the App Mesh workshop setup; [`ProvisionConfig::named`] derives all names
//! from a single environment name. Configs can be loaded from TOML and are
//! validated once before a run starts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::Tag;
use crate::error::{ConfigError, ProvisionError};
use crate::identity::EC2_SERVICE_PRINCIPAL;
use crate::retry::RetryConfig;

pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_ENVIRONMENT_NAME: &str = "AppMesh-Workshop";
pub const ADMINISTRATOR_ACCESS_ARN: &str = "arn:aws:iam::aws:policy/AdministratorAccess";
pub const RUN_SHELL_SCRIPT_DOCUMENT: &str = "AWS-RunShellScript";

/// IAM role and instance profile names are limited to 64 and 128 characters.
const MAX_ROLE_NAME_LEN: usize = 64;
const MAX_PROFILE_NAME_LEN: usize = 128;

/// Full configuration for one provisioning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Target region
    pub region: String,
    pub environment: EnvironmentConfig,
    pub identity: IdentityConfig,
    pub discovery: DiscoveryMode,
    pub bootstrap: BootstrapConfig,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
}

/// The Cloud9 environment to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub name: String,
    pub description: String,
    /// Instance size class, e.g. `t2.micro`
    pub instance_type: String,
    /// AMI alias or SSM path; left to the service default when unset
    pub image_id: Option<String>,
    /// Tag applied at creation and used to find the instance again
    pub tag: Tag,
}

/// Role and instance profile for the environment's instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub role_name: String,
    pub profile_name: String,
    pub managed_policy_arn: String,
    /// Service allowed to assume the role
    pub trusted_service: String,
}

fn default_trusted_service() -> String {
    EC2_SERVICE_PRINCIPAL.to_string()
}

/// How the instance behind the environment is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Filter on the tag applied at creation.
    #[default]
    Tag,
    /// Filter on `Name = aws-cloud9-<name>-<environment id>`.
    DerivedName,
}

/// What runs on the instance once everything is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub document_name: String,
    pub working_directory: String,
    pub commands: Vec<String>,
}

fn default_document_name() -> String {
    RUN_SHELL_SCRIPT_DOCUMENT.to_string()
}

/// Delays and poll bounds, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait between environment creation and the first instance lookup
    pub settle_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub instance_timeout_secs: u64,
    pub environment_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 30,
            poll_interval_secs: 5,
            instance_timeout_secs: 600,
            environment_timeout_secs: 1200,
        }
    }
}

impl TimingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.instance_timeout_secs)
    }

    pub fn environment_timeout(&self) -> Duration {
        Duration::from_secs(self.environment_timeout_secs)
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let mut config = Self::named(DEFAULT_ENVIRONMENT_NAME);
        config.environment.description = "AppMesh Workshop IDE.".to_string();
        config.identity.role_name = format!("{DEFAULT_ENVIRONMENT_NAME}-Admin");
        config.identity.profile_name = format!("{DEFAULT_ENVIRONMENT_NAME}-Admin");
        config
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        ProvisionConfig::default().environment
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        ProvisionConfig::default().identity
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        ProvisionConfig::default().bootstrap
    }
}

impl ProvisionConfig {
    /// Configuration with every name derived from `name`:
    /// role `<name>-Admin`, profile `<name>-Profile`, tag `Env=<name>-E`.
    pub fn named(name: &str) -> Self {
        ProvisionConfig {
            region: region_from_env().unwrap_or_else(|| DEFAULT_REGION.to_string()),
            environment: EnvironmentConfig {
                name: name.to_string(),
                description: format!("{name} IDE."),
                instance_type: "t2.micro".to_string(),
                image_id: None,
                tag: Tag::new("Env", format!("{name}-E")),
            },
            identity: IdentityConfig {
                role_name: format!("{name}-Admin"),
                profile_name: format!("{name}-Profile"),
                managed_policy_arn: ADMINISTRATOR_ACCESS_ARN.to_string(),
                trusted_service: default_trusted_service(),
            },
            discovery: DiscoveryMode::Tag,
            bootstrap: BootstrapConfig {
                document_name: default_document_name(),
                working_directory: "/home/ec2-user/environment".to_string(),
                commands: vec![
                    "curl -s https://raw.githubusercontent.com/bluecrayon52/appmeshworkshop/main/app_mesh.sh -o app_mesh.sh".to_string(),
                    "chmod +x app_mesh.sh".to_string(),
                    "sudo -u ec2-user ./app_mesh.sh".to_string(),
                ],
            },
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Load a TOML file; missing sections and keys fall back to [`Default`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML.
    ///
    /// Setting `environment.name` derives the description, tag, role and
    /// profile names from it as [`ProvisionConfig::named`] does, unless the
    /// file sets those keys itself.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: toml::Table = toml::from_str(content)?;
        let name = raw
            .get("environment")
            .and_then(|env| env.get("name"))
            .and_then(toml::Value::as_str)
            .map(str::to_string);

        let mut config: ProvisionConfig = toml::Value::Table(raw.clone()).try_into()?;
        if let Some(name) = name {
            let derived = Self::named(&name);
            let is_set = |section: &str, key: &str| {
                raw.get(section).and_then(|s| s.get(key)).is_some()
            };

            if !is_set("environment", "description") {
                config.environment.description = derived.environment.description;
            }
            if !is_set("environment", "tag") {
                config.environment.tag = derived.environment.tag;
            }
            if !is_set("identity", "role_name") {
                config.identity.role_name = derived.identity.role_name;
            }
            if !is_set("identity", "profile_name") {
                config.identity.profile_name = derived.identity.profile_name;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn with_discovery(mut self, mode: DiscoveryMode) -> Self {
        self.discovery = mode;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check the configuration before any external call is made.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        require_non_empty("region", &self.region)?;
        require_non_empty("environment.name", &self.environment.name)?;
        require_non_empty("environment.instance_type", &self.environment.instance_type)?;
        require_non_empty("environment.tag.key", &self.environment.tag.key)?;
        require_non_empty("environment.tag.value", &self.environment.tag.value)?;
        require_non_empty("identity.managed_policy_arn", &self.identity.managed_policy_arn)?;
        require_non_empty("identity.trusted_service", &self.identity.trusted_service)?;
        require_iam_name("identity.role_name", &self.identity.role_name, MAX_ROLE_NAME_LEN)?;
        require_iam_name(
            "identity.profile_name",
            &self.identity.profile_name,
            MAX_PROFILE_NAME_LEN,
        )?;
        require_non_empty("bootstrap.document_name", &self.bootstrap.document_name)?;
        require_non_empty("bootstrap.working_directory", &self.bootstrap.working_directory)?;

        if self.bootstrap.commands.is_empty() {
            return Err(invalid("bootstrap.commands must not be empty"));
        }
        if self.bootstrap.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid("bootstrap.commands must not contain blank commands"));
        }

        let timing = &self.timing;
        if timing.poll_interval_secs == 0 {
            return Err(invalid("timing.poll_interval_secs must be positive"));
        }
        if timing.instance_timeout_secs < timing.poll_interval_secs {
            return Err(invalid(
                "timing.instance_timeout_secs must not be shorter than the poll interval",
            ));
        }
        if timing.environment_timeout_secs < timing.poll_interval_secs {
            return Err(invalid(
                "timing.environment_timeout_secs must not be shorter than the poll interval",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }

        Ok(())
    }
}

/// Region from `AWS_REGION`, then `AWS_DEFAULT_REGION`.
pub fn region_from_env() -> Option<String> {
    ["AWS_REGION", "AWS_DEFAULT_REGION"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty())
}

fn invalid(message: impl Into<String>) -> ProvisionError {
    ProvisionError::InvalidConfig(message.into())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ProvisionError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_iam_name(field: &str, value: &str, max_len: usize) -> Result<(), ProvisionError> {
    require_non_empty(field, value)?;
    if value.len() > max_len {
        return Err(invalid(format!(
            "{field} is {} characters, the limit is {max_len}",
            value.len()
        )));
    }
    // IAM names: alphanumerics and +=,.@_-
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "+=,.@_-".contains(*c)))
    {
        return Err(invalid(format!("{field} contains invalid character {bad:?}")));
    }
    Ok(())
}
