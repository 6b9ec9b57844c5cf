//! Full reconcile: registry resources first, then either the standalone
//! stack or the stack set fan-out.
//!
//! With `--dry-run` both planes are wrapped in recording decorators; lookups
//! still run against the live systems.
use super::settings::{retry_policy, CloudRunSettings, RegistryRunSettings};
use super::{finish, load_desired};
use crate::cli::ReconcileArgs;
use crate::cloud::{
    AwsCli, CloudApi, SingleStackReconciler, StackLocator, StackRequest, WiringChecker,
    RULE_NAME_OUTPUT,
};
use crate::config;
use crate::desired::{DesiredState, StackParameters, StackTarget};
use crate::dry_run::{DryRunCloud, DryRunRegistry, PlanLog};
use crate::error::{ErrorRecord, ReconcileError, ReconcileResult};
use crate::fanout::{CancelToken, FanoutController};
use crate::preflight::PreflightValidator;
use crate::registry::{HttpRegistry, RegistryApi, RegistryReconciler, RegistrySettings};
use crate::report::{FanoutReport, RunMode, RunOutcome, RunReport};
use crate::retry::RetryPolicy;
use crate::util::{elapsed_ms, now_epoch_ms};
use anyhow::Result;
use std::path::Path;
use std::time::Instant;

struct ReconcileRun<'a> {
    args: &'a ReconcileArgs,
    desired: &'a DesiredState,
    registry: RegistryRunSettings,
    cloud: CloudRunSettings,
    retry: RetryPolicy,
    cancel: &'a CancelToken,
    log: &'a PlanLog,
}

impl ReconcileRun<'_> {
    fn execute(&self, report: &mut RunReport) -> ReconcileResult<()> {
        let connection = self.registry.connection(self.retry)?;
        let http = HttpRegistry::connect(&connection)?;
        let dry_registry;
        let registry: &dyn RegistryApi = if self.args.dry_run {
            dry_registry = DryRunRegistry::new(&http, &self.registry.ingest_base_url, self.log);
            &dry_registry
        } else {
            &http
        };

        let started = Instant::now();
        let outcome = RegistryReconciler::new(
            registry,
            RegistrySettings {
                ingest_base_url: self.registry.ingest_base_url.clone(),
                force_config_subresource: self.args.force_config,
            },
        )
        .reconcile(self.desired)?;
        tracing::info!(
            elapsed_ms = elapsed_ms(started),
            resources = outcome.resources.len(),
            unchanged = outcome.all_unchanged(),
            "registry reconcile complete"
        );
        let webhook_url = outcome.webhook_url.clone();
        report.registry = Some(outcome);

        if self.args.registry_only {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            report.outcome = RunOutcome::Cancelled;
            return Ok(());
        }

        let aws = AwsCli::new(&self.cloud.aws_cli(self.desired))?;
        let dry_cloud;
        let cloud: &dyn CloudApi = if self.args.dry_run {
            dry_cloud = DryRunCloud::new(&aws, self.log);
            &dry_cloud
        } else {
            &aws
        };
        let parameters = self.desired.stack_parameters(&webhook_url);
        if self.desired.fanout_targets.is_some() {
            self.fan_out(cloud, aws.program(), &webhook_url, &parameters, report)
        } else {
            self.single_stack(cloud, &parameters, report)
        }
    }

    fn single_stack(
        &self,
        cloud: &dyn CloudApi,
        parameters: &StackParameters,
        report: &mut RunReport,
    ) -> ReconcileResult<()> {
        let caller = self
            .retry
            .run("get caller identity", None, || cloud.caller_identity())?;
        let region = self.desired.region_default.as_str();
        let locator = StackLocator::Stack {
            stack_name: self.desired.stack_name.clone(),
            target: StackTarget::new(caller.account_id, region),
        };
        let request = StackRequest {
            locator: locator.clone(),
            template: &self.desired.template,
            template_digest: self.desired.template_digest.as_deref(),
            parameters,
        };
        let result = SingleStackReconciler::new(cloud, self.retry, self.cloud.settle)
            .reconcile(&request);
        let succeeded = result.status.is_success();
        let rule_name = result.outputs.get(RULE_NAME_OUTPUT).cloned();
        report.stacks = Some(FanoutReport::single(result));
        if !succeeded {
            report.outcome = RunOutcome::Failed;
            return Ok(());
        }
        if self.args.dry_run {
            tracing::info!("dry run: skipping post-deploy wiring check");
            return Ok(());
        }

        let wiring = WiringChecker::new(cloud, self.retry).check_stack(
            &locator,
            &self.desired.queue_name,
            &self.desired.function_name,
            rule_name.as_deref(),
        );
        match wiring {
            Ok(wiring) => report.wiring = Some(wiring),
            Err(err) => {
                tracing::warn!(error = %err, "wiring check failed");
                report.error = Some(ErrorRecord::from(&err.context("wiring check")));
                report.outcome = RunOutcome::Failed;
            }
        }
        Ok(())
    }

    fn fan_out(
        &self,
        cloud: &dyn CloudApi,
        cli_program: &str,
        webhook_url: &str,
        parameters: &StackParameters,
        report: &mut RunReport,
    ) -> ReconcileResult<()> {
        let preflight = PreflightValidator::new(cloud, self.retry)
            .with_cli_program(cli_program)
            .validate(self.desired, webhook_url);
        let clearance = preflight.clearance();
        eprintln!("{}", preflight.render());
        report.preflight = Some(preflight);

        let Some(clearance) = clearance else {
            report.outcome = RunOutcome::Blocked;
            return Ok(());
        };
        if !self.args.apply && !self.args.dry_run {
            tracing::info!("preflight clean; pass --apply to deploy the stack set");
            report.outcome = RunOutcome::Blocked;
            return Ok(());
        }

        let fanout = FanoutController::new(cloud, self.retry, self.cloud.settle, self.cancel.clone())
            .apply(self.desired, parameters, Some(&clearance))?;
        report.outcome = if self.cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else if fanout.is_success() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };
        report.stacks = Some(fanout);
        Ok(())
    }
}

/// Reconcile both control planes and return the exit code.
pub fn run_reconcile(args: &ReconcileArgs, out: Option<&Path>, cancel: &CancelToken) -> Result<i32> {
    let mode = if args.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Apply
    };
    let mut report = RunReport::new(mode, now_epoch_ms()?);
    let persist = !args.dry_run;
    let Some(mut desired) = load_desired(&args.config, &mut report) else {
        return finish(&report, out, persist);
    };

    let cloud = CloudRunSettings::from_args(&args.cloud);
    cloud.apply_overrides(&mut desired);
    if let Err(err) = config::validate(&desired) {
        report.abort(&err);
        return finish(&report, out, persist);
    }

    let log = PlanLog::new();
    let run = ReconcileRun {
        args,
        desired: &desired,
        registry: RegistryRunSettings::from_args(&args.registry),
        cloud,
        retry: retry_policy(&args.retry),
        cancel,
        log: &log,
    };
    let started = Instant::now();
    if let Err(err) = run.execute(&mut report) {
        log_run_error(&err);
        report.abort(&err);
    }
    if cancel.is_cancelled() {
        report.outcome = RunOutcome::Cancelled;
    }
    if args.dry_run {
        report.planned_operations = log.take_sorted();
        tracing::info!(
            planned = report.planned_operations.len(),
            "dry run: no changes were made"
        );
    }
    tracing::info!(elapsed_ms = elapsed_ms(started), "reconcile complete");
    finish(&report, out, persist)
}

fn log_run_error(err: &ReconcileError) {
    tracing::error!(kind = %err.kind(), error = %err, "run aborted");
}
