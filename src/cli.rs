//! CLI argument parsing for the provisioning workflow.
//!
//! The CLI is thin: it reads flags and environment once, builds run settings,
//! and hands them to the workflow layer.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_API_BASE_URL: &str = "https://api.getport.io";
pub const DEFAULT_INGEST_BASE_URL: &str = "https://ingest.getport.io";

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "pprov",
    version,
    about = "Idempotent provisioning for a registry webhook and cloud event pipeline",
    after_help = "Commands:\n  check --config <file>                 Validate the desired state offline\n  reconcile --config <file>             Reconcile registry resources, then the stack or stack set\n  preflight --config <file>             Validate fan-out prerequisites without changing anything\n  drift --config <file>                 Compare live integration config with the desired one\n  send-event --webhook-url <url> --event <file>  Post a sample event\n\nExamples:\n  pprov check --config pprov.yaml\n  pprov reconcile --config pprov.yaml --dry-run\n  pprov reconcile --config pprov.yaml --apply --out run.json\n  pprov drift --config pprov.yaml --live-file live.json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write the run report JSON to this path
    #[arg(long, global = true, value_name = "PATH")]
    pub out: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Check(CheckArgs),
    Reconcile(ReconcileArgs),
    Preflight(PreflightArgs),
    Drift(DriftArgs),
    SendEvent(SendEventArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Validate the desired-state file without contacting either control plane")]
pub struct CheckArgs {
    /// Desired-state file (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,
}

/// Registry connection flags.
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    /// Registry API base URL
    #[arg(long, env = "PORT_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    /// Ingest base URL used to build webhook URLs
    #[arg(long, env = "PORT_INGEST_BASE_URL", default_value = DEFAULT_INGEST_BASE_URL)]
    pub ingest_base_url: String,

    /// Bearer token; takes precedence over client credentials
    #[arg(long, env = "PORT_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, env = "PORT_CLIENT_ID", hide_env_values = true)]
    pub client_id: Option<String>,

    #[arg(long, env = "PORT_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Timeout for one registry HTTP request, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,
}

/// Cloud control-plane flags.
#[derive(Args, Debug, Clone)]
pub struct CloudArgs {
    /// AWS CLI command prefix, e.g. "aws --profile ops"
    #[arg(long, env = "PPROV_AWS_COMMAND", default_value = "aws")]
    pub aws_command: String,

    /// Region override for the standalone stack and stack-set administration
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// Upper bound for one stack target, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 1800)]
    pub target_timeout_secs: u64,

    /// Interval between stack status polls, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Override the configured fan-out worker bound
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,
}

/// Retry flags shared by both control planes.
#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Attempts for a transient failure, first try included
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub max_attempts: u32,
}

#[derive(Parser, Debug)]
#[command(about = "Reconcile registry resources, then the standalone stack or the stack set")]
pub struct ReconcileArgs {
    /// Desired-state file (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// Record every mutation instead of sending it
    #[arg(long)]
    pub dry_run: bool,

    /// Allow mutating fan-out once preflight is clean
    #[arg(long)]
    pub apply: bool,

    /// Stop after the registry step
    #[arg(long)]
    pub registry_only: bool,

    /// Retry an ignored config update through the config subresource
    #[arg(long)]
    pub force_config: bool,

    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub cloud: CloudArgs,

    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Check fan-out prerequisites and print remediation for each issue")]
pub struct PreflightArgs {
    /// Desired-state file (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// Webhook URL to validate; resolved read-only from the registry when omitted
    #[arg(long, value_name = "URL")]
    pub webhook_url: Option<String>,

    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub cloud: CloudArgs,

    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Compare the live integration config with the desired mapping config")]
pub struct DriftArgs {
    /// Desired-state file (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// Compare against a saved integration document instead of the registry
    #[arg(long, value_name = "FILE")]
    pub live_file: Option<PathBuf>,

    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Post a JSON event file to a webhook")]
pub struct SendEventArgs {
    #[arg(long, value_name = "URL")]
    pub webhook_url: String,

    /// JSON file holding the event
    #[arg(long, value_name = "FILE")]
    pub event: PathBuf,

    /// Shape the event the way the forwarding function does
    #[arg(long)]
    pub shape: bool,

    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout_secs: u64,
}
