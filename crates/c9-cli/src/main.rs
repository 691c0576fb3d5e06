//! c9-bootstrap - Cloud9 workshop environment provisioning CLI
//!
//! ## Commands
//!
//! - `provision`: Create the environment, attach the admin profile and run the bootstrap script
//! - `handle-event`: Answer a CloudFormation custom-resource event
//! - `show-config`: Print the resolved configuration
//! - `trust-policy`: Print the role trust policy document

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn, Level};

use c9_lifecycle::{
    HttpResponseSender, LifecycleEvent, LifecycleHandler, RequestType, ResourceProperties,
    ResponseSender,
};
use c9_provision::{
    assume_role_policy, cancellation, AwsCliBackend, AwsCliConfig, CancelSignal, DiscoveryMode,
    ProvisionConfig, Provisioner,
};

#[derive(Parser)]
#[command(name = "c9-bootstrap")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision and bootstrap Cloud9 workshop environments", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "C9_BOOTSTRAP_CONFIG")]
    config: Option<PathBuf>,

    /// Region override (default: config file, then AWS_REGION, then us-west-2)
    #[arg(long, global = true)]
    region: Option<String>,

    /// Named AWS CLI profile
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full provisioning chain once
    Provision {
        #[command(flatten)]
        overrides: Overrides,

        /// Give up (and report cancellation) after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Handle a CloudFormation custom-resource event and PUT the response
    HandleEvent {
        /// Event document path, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        event: String,

        /// Give up (and report failure) after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Print the resolved configuration as JSON
    ShowConfig {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the trust policy attached to the created role
    TrustPolicy,
}

#[derive(clap::Args, Default)]
struct Overrides {
    /// Environment name; role, profile and tag names derive from it
    #[arg(short, long)]
    name: Option<String>,

    /// How to find the environment's instance
    #[arg(long, value_enum)]
    discovery: Option<DiscoveryArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum DiscoveryArg {
    /// By the tag applied at creation
    Tag,
    /// By the `aws-cloud9-<name>-<id>` Name tag
    DerivedName,
}

impl From<DiscoveryArg> for DiscoveryMode {
    fn from(arg: DiscoveryArg) -> Self {
        match arg {
            DiscoveryArg::Tag => DiscoveryMode::Tag,
            DiscoveryArg::DerivedName => DiscoveryMode::DerivedName,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    c9_provision::telemetry::init_tracing(cli.json, level);

    match &cli.command {
        Commands::Provision {
            overrides,
            deadline_secs,
        } => {
            let config = load_config(&cli, overrides)?;
            cmd_provision(&cli, config, *deadline_secs).await
        }
        Commands::HandleEvent {
            event,
            deadline_secs,
        } => cmd_handle_event(&cli, event, *deadline_secs).await,
        Commands::ShowConfig { overrides } => {
            let config = load_config(&cli, overrides)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::TrustPolicy => {
            let config = load_config(&cli, &Overrides::default())?;
            let policy = assume_role_policy(&config.identity.trusted_service);
            println!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(())
        }
    }
}

/// Config file (or defaults), then flag overrides, then validation.
fn load_config(cli: &Cli, overrides: &Overrides) -> Result<ProvisionConfig> {
    let mut config = match &cli.config {
        Some(path) => ProvisionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ProvisionConfig::default(),
    };

    if let Some(name) = &overrides.name {
        let properties = ResourceProperties {
            environment_name: Some(name.clone()),
            ..ResourceProperties::default()
        };
        config = properties.apply(config);
    }
    if let Some(region) = &cli.region {
        config = config.with_region(region);
    }
    if let Some(discovery) = overrides.discovery {
        config = config.with_discovery(discovery.into());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn aws_backend(cli: &Cli, config: &ProvisionConfig) -> Result<AwsCliBackend> {
    let mut aws = AwsCliConfig::new(&config.region);
    if let Some(profile) = &cli.profile {
        aws = aws.with_profile(profile);
    }
    let backend = AwsCliBackend::new(aws);

    if !backend.is_available().await {
        bail!(
            "`{}` not found or not executable; install the AWS CLI or set C9_AWS_CLI",
            backend.config().binary
        );
    }
    Ok(backend)
}

/// Cancel on Ctrl-C or once `deadline_secs` have passed.
fn cancel_on_interrupt(deadline_secs: Option<u64>) -> CancelSignal {
    let (handle, signal) = cancellation();

    tokio::spawn(async move {
        let deadline = async {
            match deadline_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("interrupt received, cancelling run"),
            _ = deadline => warn!(deadline_secs = ?deadline_secs, "deadline reached, cancelling run"),
        }
        handle.cancel();
    });

    signal
}

async fn cmd_provision(cli: &Cli, config: ProvisionConfig, deadline_secs: Option<u64>) -> Result<()> {
    let backend = aws_backend(cli, &config).await?;
    let provisioner = Provisioner::new(Arc::new(backend), config)?;

    info!(
        environment = %provisioner.config().environment.name,
        region = %provisioner.config().region,
        "provisioning"
    );

    let report = provisioner.run(cancel_on_interrupt(deadline_secs)).await;
    let states: Vec<&str> = report.states.iter().map(|t| t.state.name()).collect();

    match report.result {
        Ok(outcome) => {
            let summary = json!({
                "run_id": report.run_id,
                "started_at": report.started_at,
                "finished_at": report.finished_at,
                "states": states,
                "outcome": outcome,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(err) => {
            warn!(run_id = %report.run_id, states = ?states, "provisioning failed");
            Err(err).context("Provisioning failed")
        }
    }
}

/// Every event that names a `ResponseURL` gets a response, even when the
/// configuration or the AWS CLI cannot be set up.
async fn cmd_handle_event(cli: &Cli, source: &str, deadline_secs: Option<u64>) -> Result<()> {
    let raw = read_event(source)?;
    let sender: Arc<dyn ResponseSender> = Arc::new(HttpResponseSender::new()?);

    let request_type = LifecycleEvent::recover(&raw).map(|event| event.request_type);
    info!(request_type = ?request_type, "handling custom-resource event");

    let handler = match request_type {
        Some(RequestType::Create) => match create_backend(cli).await {
            Ok((backend, config)) => LifecycleHandler::new(Arc::new(backend), config, sender),
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(error = %reason, "provisioning backend unavailable");
                LifecycleHandler::without_backend(sender, reason)
            }
        },
        _ => LifecycleHandler::without_backend(sender, "only create requests provision"),
    };

    let document = handler
        .handle_raw(&raw, cancel_on_interrupt(deadline_secs))
        .await
        .context("Failed to deliver custom-resource response")?;

    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

async fn create_backend(cli: &Cli) -> Result<(AwsCliBackend, ProvisionConfig)> {
    let config = load_config(cli, &Overrides::default())?;
    let backend = aws_backend(cli, &config).await?;
    Ok((backend, config))
}

fn read_event(source: &str) -> Result<String> {
    if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read event from stdin")?;
        Ok(raw)
    } else {
        std::fs::read_to_string(Path::new(source))
            .with_context(|| format!("Failed to read event from {:?}", source))
    }
}
