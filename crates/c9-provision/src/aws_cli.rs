//! AWS backend driven through the `aws` command-line client
//!
//! Every Cloud Provisioning API call becomes one `aws <service> <operation>`
//! invocation with `--output json`. Credentials, endpoints and signing are
//! left to the CLI's own configuration chain.
//!
//! The CLI's built-in retries are pinned to a single attempt so that
//! [`crate::retry`] is the only place transient errors are retried.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::api::*;
use crate::config::{region_from_env, DEFAULT_REGION};
use crate::error::{ApiError, ApiErrorKind};

/// AWS CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsCliConfig {
    /// Path or name of the `aws` binary
    pub binary: String,
    pub region: String,
    /// Named profile from the shared config files (optional)
    pub profile: Option<String>,
    /// Attempts the CLI makes on its own before reporting an error
    pub cli_max_attempts: u32,
    /// Upper bound for a single CLI invocation
    pub call_timeout_secs: u64,
}

impl Default for AwsCliConfig {
    fn default() -> Self {
        AwsCliConfig {
            binary: std::env::var("C9_AWS_CLI").unwrap_or_else(|_| "aws".to_string()),
            region: region_from_env().unwrap_or_else(|| DEFAULT_REGION.to_string()),
            profile: std::env::var("AWS_PROFILE").ok(),
            cli_max_attempts: 1,
            call_timeout_secs: 120,
        }
    }
}

impl AwsCliConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific region
    pub fn new(region: &str) -> Self {
        AwsCliConfig {
            region: region.to_string(),
            ..Self::default()
        }
    }

    pub fn with_profile(mut self, profile: &str) -> Self {
        self.profile = Some(profile.to_string());
        self
    }

    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }
}

/// Cloud Provisioning API backed by the `aws` CLI.
#[derive(Debug)]
pub struct AwsCliBackend {
    config: AwsCliConfig,
}

impl AwsCliBackend {
    pub fn new(config: AwsCliConfig) -> Self {
        AwsCliBackend { config }
    }

    /// Create backend from environment variables
    pub fn from_env() -> Self {
        Self::new(AwsCliConfig::from_env())
    }

    pub fn config(&self) -> &AwsCliConfig {
        &self.config
    }

    /// Check whether the configured `aws` binary can be executed.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Full argument list for one invocation, global options included.
    fn invocation(&self, service: &str, operation: &str, args: Vec<String>) -> Vec<String> {
        let mut full = vec![service.to_string(), operation.to_string()];
        full.extend(args);
        full.extend(["--output".to_string(), "json".to_string()]);
        full.extend(["--region".to_string(), self.config.region.clone()]);
        if let Some(profile) = &self.config.profile {
            full.extend(["--profile".to_string(), profile.clone()]);
        }
        full
    }

    /// Run one CLI invocation and decode its JSON stdout.
    async fn run(&self, service: &str, operation: &str, args: Vec<String>) -> ApiResult<Value> {
        let args = self.invocation(service, operation, args);
        debug!(service = %service, operation = %operation, "invoking aws cli");

        let child = Command::new(&self.config.binary)
            .args(&args)
            .env("AWS_MAX_ATTEMPTS", self.config.cli_max_attempts.to_string())
            .env("AWS_RETRY_MODE", "standard")
            .env("AWS_PAGER", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ApiError::rejected(format!("failed to run {}: {e}", self.config.binary))
            })?;

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.call_timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            ApiError::client_timeout(format!(
                "{service} {operation} gave no response within {} seconds",
                self.config.call_timeout_secs
            ))
        })?
        .map_err(|e| ApiError::rejected(format!("failed to wait for aws cli: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parse_cli_error(&stderr));
        }

        decode_stdout(&output.stdout)
    }
}

fn decode_stdout(stdout: &[u8]) -> ApiResult<Value> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(stdout)
        .map_err(|e| ApiError::rejected(format!("unreadable aws cli output: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> ApiResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::rejected(format!("unexpected {what} response: {e}")))
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "EC2ThrottledException",
    "SlowDown",
    "PriorRequestNotComplete",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "Unavailable",
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "InternalServerErrorException",
    "RequestTimeout",
    "RequestTimeoutException",
];

const ALREADY_EXISTS_CODES: &[&str] = &[
    "EntityAlreadyExists",
    "AlreadyExistsException",
    "ConflictException",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchEntity",
    "NotFoundException",
    "InvalidInstanceID.NotFound",
];

/// Connection-level failures reported by the CLI without an error code.
const TRANSIENT_MESSAGES: &[&str] = &[
    "Could not connect to the endpoint URL",
    "Connect timeout on endpoint URL",
    "Read timeout on endpoint URL",
    "Connection was closed before we received a valid response",
];

pub fn classify_code(code: &str) -> ApiErrorKind {
    if TRANSIENT_CODES.contains(&code) {
        ApiErrorKind::Transient
    } else if ALREADY_EXISTS_CODES.contains(&code) {
        ApiErrorKind::AlreadyExists
    } else if NOT_FOUND_CODES.contains(&code) {
        ApiErrorKind::NotFound
    } else {
        ApiErrorKind::Rejected
    }
}

/// Parse the CLI's stderr into an [`ApiError`].
///
/// Service errors look like
/// `An error occurred (Code) when calling the Operation operation: message`.
pub fn parse_cli_error(stderr: &str) -> ApiError {
    const MARKER: &str = "An error occurred (";

    for line in stderr.lines() {
        let Some(start) = line.find(MARKER) else {
            continue;
        };
        let rest = &line[start + MARKER.len()..];
        let Some(end) = rest.find(')') else {
            continue;
        };
        let code = &rest[..end];
        let tail = &rest[end + 1..];
        let mut message = match tail.find(" operation") {
            Some(at) => &tail[at + " operation".len()..],
            None => tail,
        };
        // v2 inserts "(reached max retries: N)" before the colon
        if message.starts_with(" (") {
            if let Some(close) = message.find(')') {
                message = &message[close + 1..];
            }
        }
        let message = message.trim_start_matches(':').trim();

        return ApiError::new(classify_code(code), message).with_code(code);
    }

    let message = stderr.trim();
    if TRANSIENT_MESSAGES.iter().any(|m| message.contains(m)) {
        ApiError::transient(message)
    } else {
        ApiError::rejected(message)
    }
}

fn is_existing_association(err: &ApiError) -> bool {
    err.code.as_deref() == Some("IncorrectState")
        && err.message.to_lowercase().contains("existing association")
}

// ---------------------------------------------------------------------------
// Argument builders
// ---------------------------------------------------------------------------

fn create_environment_args(request: &EnvironmentRequest) -> Vec<String> {
    let tags: Vec<Value> = request
        .tags
        .iter()
        .map(|t| json!({ "Key": t.key, "Value": t.value }))
        .collect();

    let mut args = vec![
        "--name".to_string(),
        request.name.clone(),
        "--description".to_string(),
        request.description.clone(),
        "--instance-type".to_string(),
        request.instance_type.clone(),
    ];
    if let Some(image_id) = &request.image_id {
        args.extend(["--image-id".to_string(), image_id.clone()]);
    }
    if !tags.is_empty() {
        args.extend(["--tags".to_string(), Value::Array(tags).to_string()]);
    }
    args
}

fn describe_instances_args(filter: &InstanceFilter) -> Vec<String> {
    let filters = json!([{ "Name": filter.name, "Values": filter.values }]);
    vec!["--filters".to_string(), filters.to_string()]
}

fn send_command_args(command: &BootstrapCommand) -> Vec<String> {
    vec![
        "--instance-ids".to_string(),
        command.instance_id.to_string(),
        "--document-name".to_string(),
        command.document_name.clone(),
        "--parameters".to_string(),
        command.parameters().to_string(),
    ]
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEnvironmentOutput {
    environment_id: String,
}

#[derive(Deserialize)]
struct DescribeEnvironmentsOutput {
    environments: Vec<EnvironmentRecord>,
}

#[derive(Deserialize)]
struct EnvironmentRecord {
    lifecycle: Option<LifecycleRecord>,
}

#[derive(Deserialize)]
struct LifecycleRecord {
    status: String,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceRecord {
    instance_id: String,
    state: InstanceStateRecord,
    #[serde(default)]
    tags: Vec<TagRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStateRecord {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagRecord {
    key: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandOutput {
    command: CommandRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandRecord {
    command_id: String,
}

fn instances_from(output: DescribeInstancesOutput) -> Vec<InstanceSummary> {
    output
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(|i| InstanceSummary {
            id: InstanceId::new(i.instance_id),
            state: InstanceState::parse(&i.state.name),
            tags: i
                .tags
                .into_iter()
                .map(|t| (t.key, t.value))
                .collect::<BTreeMap<_, _>>(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Capability implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl EnvironmentApi for AwsCliBackend {
    async fn create_environment(&self, request: &EnvironmentRequest) -> ApiResult<EnvironmentId> {
        let value = self
            .run("cloud9", "create-environment-ec2", create_environment_args(request))
            .await?;
        let output: CreateEnvironmentOutput = decode(value, "create-environment-ec2")?;
        Ok(EnvironmentId::new(output.environment_id))
    }

    async fn describe_environment(&self, id: &EnvironmentId) -> ApiResult<EnvironmentDescription> {
        let value = self
            .run(
                "cloud9",
                "describe-environments",
                vec!["--environment-ids".to_string(), id.to_string()],
            )
            .await?;
        let output: DescribeEnvironmentsOutput = decode(value, "describe-environments")?;

        let lifecycle = output
            .environments
            .into_iter()
            .next()
            .ok_or_else(|| {
                ApiError::new(ApiErrorKind::NotFound, format!("environment {id} not found"))
            })?
            .lifecycle
            .ok_or_else(|| ApiError::rejected(format!("environment {id} has no lifecycle")))?;

        Ok(EnvironmentDescription {
            status: EnvironmentStatus::parse(&lifecycle.status),
            reason: lifecycle.reason,
        })
    }
}

#[async_trait]
impl IdentityApi for AwsCliBackend {
    async fn create_role(&self, role_name: &str, trust_policy: &str) -> ApiResult<()> {
        self.run(
            "iam",
            "create-role",
            vec![
                "--role-name".to_string(),
                role_name.to_string(),
                "--assume-role-policy-document".to_string(),
                trust_policy.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn attach_managed_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()> {
        self.run(
            "iam",
            "attach-role-policy",
            vec![
                "--role-name".to_string(),
                role_name.to_string(),
                "--policy-arn".to_string(),
                policy_arn.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn create_instance_profile(&self, profile_name: &str) -> ApiResult<()> {
        self.run(
            "iam",
            "create-instance-profile",
            vec![
                "--instance-profile-name".to_string(),
                profile_name.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()> {
        self.run(
            "iam",
            "add-role-to-instance-profile",
            vec![
                "--instance-profile-name".to_string(),
                profile_name.to_string(),
                "--role-name".to_string(),
                role_name.to_string(),
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for AwsCliBackend {
    async fn describe_instances(&self, filter: &InstanceFilter) -> ApiResult<Vec<InstanceSummary>> {
        let value = self
            .run("ec2", "describe-instances", describe_instances_args(filter))
            .await?;
        let output: DescribeInstancesOutput = decode(value, "describe-instances")?;
        Ok(instances_from(output))
    }

    async fn associate_instance_profile(
        &self,
        profile_name: &str,
        instance_id: &InstanceId,
    ) -> ApiResult<Association> {
        let result = self
            .run(
                "ec2",
                "associate-iam-instance-profile",
                vec![
                    "--iam-instance-profile".to_string(),
                    json!({ "Name": profile_name }).to_string(),
                    "--instance-id".to_string(),
                    instance_id.to_string(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(Association::Associated),
            Err(err) if is_existing_association(&err) => Ok(Association::AlreadyAssociated),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RemoteExecApi for AwsCliBackend {
    async fn send_command(&self, command: &BootstrapCommand) -> ApiResult<CommandId> {
        let value = self
            .run("ssm", "send-command", send_command_args(command))
            .await?;
        let output: SendCommandOutput = decode(value, "send-command")?;
        Ok(CommandId::new(output.command.command_id))
    }
}
