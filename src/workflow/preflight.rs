//! Standalone preflight: validate fan-out prerequisites and change nothing.
use super::settings::{retry_policy, CloudRunSettings, RegistryRunSettings};
use super::{finish, load_desired};
use crate::cli::PreflightArgs;
use crate::cloud::AwsCli;
use crate::config;
use crate::desired::DesiredState;
use crate::dry_run::{DryRunRegistry, PlanLog};
use crate::error::ReconcileResult;
use crate::preflight::PreflightValidator;
use crate::registry::{resolve_webhook, HttpRegistry};
use crate::report::{RunMode, RunOutcome, RunReport};
use crate::retry::RetryPolicy;
use crate::util::now_epoch_ms;
use anyhow::Result;
use std::path::Path;

/// Resolve the webhook URL without writing: lookups are live, a webhook that
/// would be created resolves to its simulated URL.
fn resolve_webhook_read_only(
    args: &PreflightArgs,
    desired: &DesiredState,
    retry: RetryPolicy,
) -> ReconcileResult<String> {
    if let Some(url) = args.webhook_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        return Ok(url.to_string());
    }
    let settings = RegistryRunSettings::from_args(&args.registry);
    let http = HttpRegistry::connect(&settings.connection(retry)?)?;
    let log = PlanLog::new();
    let registry = DryRunRegistry::new(&http, &settings.ingest_base_url, &log);
    let resolved = resolve_webhook(
        &registry,
        &desired.webhook_spec,
        &settings.ingest_base_url,
        &desired.registry_integration_id,
        desired.documents.webhook_mappings.as_ref(),
    )?;
    if !log.is_empty() {
        tracing::info!(url = %resolved.url, "webhook does not exist yet; validating its future URL");
    }
    Ok(resolved.url)
}

/// Run preflight checks and print the rendered report to stderr.
pub fn run_preflight(args: &PreflightArgs, out: Option<&Path>) -> Result<i32> {
    let mut report = RunReport::new(RunMode::Preflight, now_epoch_ms()?);
    let Some(mut desired) = load_desired(&args.config, &mut report) else {
        return finish(&report, out, false);
    };
    let cloud = CloudRunSettings::from_args(&args.cloud);
    cloud.apply_overrides(&mut desired);
    if let Err(err) = config::validate(&desired) {
        report.abort(&err);
        return finish(&report, out, false);
    }
    let retry = retry_policy(&args.retry);

    let webhook_url = match resolve_webhook_read_only(args, &desired, retry) {
        Ok(url) => url,
        Err(err) => {
            report.abort(&err);
            return finish(&report, out, false);
        }
    };
    let aws = match AwsCli::new(&cloud.aws_cli(&desired)) {
        Ok(aws) => aws,
        Err(err) => {
            report.abort(&err);
            return finish(&report, out, false);
        }
    };

    let preflight = PreflightValidator::new(&aws, retry)
        .with_cli_program(aws.program())
        .validate(&desired, &webhook_url);
    eprintln!("{}", preflight.render());
    if preflight.has_blocking() {
        report.outcome = RunOutcome::Blocked;
    }
    report.preflight = Some(preflight);
    finish(&report, out, false)
}
