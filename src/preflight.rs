//! Read-only checks that gate a mutating fan-out.
//!
//! Issues are data. The validator only returns an error-free report or one
//! listing what is wrong; it never aborts on a finding. A clean report issues
//! a `PreflightClearance` bound to the fingerprint of the validated input.
use crate::cloud::{CloudApi, StackLocator, StackPhase};
use crate::desired::{
    AccountSelector, DesiredState, FanoutTarget, FanoutTargets, PermissionModel, StackTarget,
};
use crate::error::{ErrorKind, ReconcileError, ReconcileResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

const STACKSETS_PRINCIPAL: &str = "member.org.stacksets.cloudformation.amazonaws.com";

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks a mutating fan-out.
    Error,
    Warning,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Issue {
    fn error(message: impl Into<String>, remediation: Option<&str>) -> Self {
        Issue {
            severity: Severity::Error,
            message: message.into(),
            remediation: remediation.map(str::to_string),
        }
    }

    fn warning(message: impl Into<String>, remediation: Option<&str>) -> Self {
        Issue {
            severity: Severity::Warning,
            message: message.into(),
            remediation: remediation.map(str::to_string),
        }
    }

    /// A read that failed. A denied read means the caller lacks a grant the
    /// reconciler needs, so it blocks; other failures only warn.
    fn failed_read(message: impl Into<String>, err: &ReconcileError, remediation: Option<&str>) -> Self {
        match err.kind() {
            ErrorKind::Permission | ErrorKind::Auth => Issue::error(message, remediation),
            _ => Issue::warning(message, remediation),
        }
    }

    fn render_into(&self, out: &mut String, indent: &str) {
        let _ = writeln!(out, "{indent}[{}] {}", self.severity.label(), self.message);
        if let Some(remediation) = &self.remediation {
            let _ = writeln!(out, "{indent}    Action: {remediation}");
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: FanoutTarget,
    /// Concrete accounts the selector resolved to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<String>,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_set_name: Option<String>,
    /// Issues that are not tied to one target.
    pub general: Vec<Issue>,
    pub targets: Vec<TargetReport>,
}

/// Proof that a preflight over exactly this input found no blocking issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightClearance {
    fingerprint: String,
}

impl PreflightClearance {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl PreflightReport {
    fn all_issues(&self) -> impl Iterator<Item = &Issue> {
        self.general
            .iter()
            .chain(self.targets.iter().flat_map(|target| target.issues.iter()))
    }

    pub fn error_count(&self) -> usize {
        self.all_issues()
            .filter(|issue| issue.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.all_issues()
            .filter(|issue| issue.severity == Severity::Warning)
            .count()
    }

    pub fn has_blocking(&self) -> bool {
        self.error_count() > 0
    }

    pub fn clearance(&self) -> Option<PreflightClearance> {
        if self.has_blocking() {
            return None;
        }
        Some(PreflightClearance {
            fingerprint: self.fingerprint.clone(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        match &self.stack_set_name {
            Some(name) => {
                let _ = writeln!(out, "Preflight for stack set {name}");
            }
            None => out.push_str("Preflight\n"),
        }
        for issue in &self.general {
            issue.render_into(&mut out, "");
        }
        for target in &self.targets {
            if target.issues.is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "Target {} in {}:",
                target.target.account_selector, target.target.region
            );
            for issue in &target.issues {
                issue.render_into(&mut out, "  ");
            }
        }
        let _ = writeln!(
            out,
            "{} blocking issue(s), {} warning(s)",
            self.error_count(),
            self.warning_count()
        );
        out
    }
}

pub struct PreflightValidator<'a> {
    cloud: &'a dyn CloudApi,
    retry: RetryPolicy,
    cli_program: Option<String>,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(cloud: &'a dyn CloudApi, retry: RetryPolicy) -> Self {
        PreflightValidator {
            cloud,
            retry,
            cli_program: None,
        }
    }

    /// Also confirm the cloud CLI program resolves on `PATH`.
    pub fn with_cli_program(mut self, program: &str) -> Self {
        self.cli_program = Some(program.to_string());
        self
    }

    fn read<T, F>(&self, label: &str, op: F) -> ReconcileResult<T>
    where
        F: FnMut() -> ReconcileResult<T>,
    {
        self.retry.run(label, None, op)
    }

    pub fn validate(&self, desired: &DesiredState, webhook_url: &str) -> PreflightReport {
        let Some(fanout) = desired.fanout_targets.as_ref() else {
            return PreflightReport {
                fingerprint: desired.stack_fingerprint(&[]),
                stack_set_name: None,
                general: vec![Issue::error(
                    "no fanout section is configured",
                    Some("Add a fanout section with regions and account selectors"),
                )],
                targets: Vec::new(),
            };
        };
        let fanout_targets = fanout.targets();
        let mut report = PreflightReport {
            fingerprint: desired.stack_fingerprint(&fanout_targets),
            stack_set_name: Some(fanout.stack_set_name.clone()),
            general: Vec::new(),
            targets: fanout_targets
                .iter()
                .map(|target| TargetReport {
                    target: target.clone(),
                    accounts: Vec::new(),
                    issues: Vec::new(),
                })
                .collect(),
        };

        self.check_inputs(webhook_url, fanout, &mut report.general);
        let Some(caller) = self.check_caller(&mut report.general) else {
            tracing::warn!("preflight stopped: caller identity unavailable");
            return report;
        };
        match fanout.permission_model {
            PermissionModel::ServiceManaged => {
                self.check_service_managed(&caller, fanout, &mut report.general)
            }
            PermissionModel::SelfManaged => self.check_self_managed(fanout, &mut report.general),
        }
        if let Err(err) = self.read("list stack sets", || self.cloud.list_stack_sets()) {
            report.general.push(Issue::failed_read(
                format!("cannot list stack sets: {err}"),
                &err,
                Some("Grant cloudformation:ListStackSets to the caller"),
            ));
        }
        self.check_template(desired, webhook_url, &mut report.general);
        let stack_set_exists = self.check_stack_set_collision(fanout, &mut report.general);
        self.check_targets(fanout, stack_set_exists, &mut report.targets);

        tracing::info!(
            stack_set = %fanout.stack_set_name,
            errors = report.error_count(),
            warnings = report.warning_count(),
            "preflight complete"
        );
        report
    }

    fn check_inputs(&self, webhook_url: &str, fanout: &FanoutTargets, general: &mut Vec<Issue>) {
        if !(webhook_url.starts_with("https://") || webhook_url.starts_with("http://")) {
            general.push(Issue::error(
                format!("webhook URL {webhook_url:?} is not an absolute http(s) URL"),
                Some("Configure a webhook identifier or a full ingest URL"),
            ));
        }
        if let Some(program) = &self.cli_program {
            if which::which(program).is_err() {
                general.push(Issue::error(
                    format!("AWS CLI {program:?} not found on PATH"),
                    Some("Install AWS CLI v2 or pass --aws-command"),
                ));
            }
        }
        if fanout.regions.is_empty() {
            general.push(Issue::error(
                "no target regions configured",
                Some("List at least one region under fanout.regions"),
            ));
        }
        if fanout.account_selectors.is_empty() {
            general.push(Issue::error(
                "no deployment targets configured",
                Some("List organizational units or accounts under fanout.targets"),
            ));
        }
    }

    fn check_caller(&self, general: &mut Vec<Issue>) -> Option<String> {
        match self.read("get caller identity", || self.cloud.caller_identity()) {
            Ok(identity) => {
                tracing::debug!(account = %identity.account_id, arn = %identity.arn, "caller identity");
                Some(identity.account_id)
            }
            Err(err) => {
                general.push(Issue::error(
                    format!("cannot determine caller identity: {err}"),
                    Some("Configure AWS credentials (aws configure or AWS_PROFILE)"),
                ));
                None
            }
        }
    }

    fn check_service_managed(&self, caller: &str, fanout: &FanoutTargets, general: &mut Vec<Issue>) {
        match self.read("describe organization", || self.cloud.management_account_id()) {
            Ok(Some(management)) if management == caller => {}
            Ok(Some(_)) => match self.read("list delegated administrators", || {
                self.cloud.is_delegated_stack_set_admin(caller)
            }) {
                Ok(true) => {}
                Ok(false) => general.push(Issue::error(
                    format!(
                        "account {caller} is neither the management account nor a delegated StackSets administrator"
                    ),
                    Some(&format!(
                        "Run from the management account, or register {caller} with \
                         `aws organizations register-delegated-administrator --service-principal {STACKSETS_PRINCIPAL}`"
                    )),
                )),
                Err(err) => general.push(Issue::failed_read(
                    format!("cannot check delegated administrators: {err}"),
                    &err,
                    Some("Grant organizations:ListDelegatedAdministrators to the caller"),
                )),
            },
            Ok(None) => general.push(Issue::error(
                format!("account {caller} is not part of an organization"),
                Some("Use permission_model: self-managed outside AWS Organizations"),
            )),
            Err(err) => general.push(Issue::error(
                format!("cannot describe organization: {err}"),
                Some("Grant organizations:DescribeOrganization to the caller"),
            )),
        }

        match self.read("list service access", || self.cloud.stack_set_trusted_access_enabled()) {
            Ok(true) => {}
            Ok(false) => general.push(Issue::error(
                "trusted access for StackSets is not enabled in the organization",
                Some(&format!(
                    "aws organizations enable-aws-service-access --service-principal {STACKSETS_PRINCIPAL}"
                )),
            )),
            Err(err) => general.push(Issue::failed_read(
                format!("cannot check StackSets trusted access: {err}"),
                &err,
                Some("Grant organizations:ListAWSServiceAccessForOrganization to the caller"),
            )),
        }

        for selector in &fanout.account_selectors {
            if let AccountSelector::Account(id) = selector {
                general.push(Issue::error(
                    format!("service-managed stack sets deploy to organizational units, but account {id} is listed directly"),
                    Some("List the account's organizational unit instead, or switch to self-managed"),
                ));
            }
        }
    }

    fn check_self_managed(&self, fanout: &FanoutTargets, general: &mut Vec<Issue>) {
        let Some(role_arn) = &fanout.admin_role_arn else {
            general.push(Issue::error(
                "self-managed stack sets need an administration role ARN",
                Some("Set fanout.admin_role_arn"),
            ));
            return;
        };
        match self.read("get role", || self.cloud.role_exists(role_arn)) {
            Ok(true) => {}
            Ok(false) => general.push(Issue::warning(
                format!("administration role {role_arn} was not found"),
                Some("Create AWSCloudFormationStackSetAdministrationRole in the administrator account"),
            )),
            Err(err) => general.push(Issue::failed_read(
                format!("cannot check administration role {role_arn}: {err}"),
                &err,
                Some("Grant iam:GetRole to the caller"),
            )),
        }
        tracing::debug!(
            execution_role = %fanout.execution_role_name,
            "execution role must exist in every target account"
        );
    }

    fn check_template(&self, desired: &DesiredState, webhook_url: &str, general: &mut Vec<Issue>) {
        let declared = match self.read("validate template", || {
            self.cloud.validate_template(&desired.template)
        }) {
            Ok(declared) => declared,
            Err(err) => {
                general.push(Issue::error(
                    format!("template {} failed validation: {}", desired.template, err.message()),
                    Some("Fix the template, or point `template` at a valid file or URL"),
                ));
                return;
            }
        };
        let by_key: BTreeMap<&str, bool> = declared
            .iter()
            .map(|param| (param.key.as_str(), param.has_default))
            .collect();
        let parameters = desired.stack_parameters(webhook_url);
        for key in parameters.keys() {
            if !by_key.contains_key(key.as_str()) {
                general.push(Issue::error(
                    format!("template does not declare parameter {key}"),
                    Some("Remove the parameter, or use a template that declares it"),
                ));
            }
        }
        for key in parameters.keep_previous_keys() {
            if by_key.get(key.as_str()) == Some(&false) {
                general.push(Issue::error(
                    format!("parameter {key} keeps its previous value, but the template has no default for new instances"),
                    Some("Give the parameter a default, or supply an explicit value"),
                ));
            }
        }
    }

    /// Returns whether the stack set already exists. A failed lookup blocks,
    /// since the collision checks cannot run without it.
    fn check_stack_set_collision(&self, fanout: &FanoutTargets, general: &mut Vec<Issue>) -> bool {
        match self.read("describe stack set", || {
            self.cloud.describe_stack_set(&fanout.stack_set_name)
        }) {
            Ok(Some(existing)) => {
                if existing.permission_model != fanout.permission_model {
                    general.push(Issue::error(
                        format!(
                            "stack set {} already exists with permission model {}",
                            fanout.stack_set_name,
                            existing.permission_model.as_api_str()
                        ),
                        Some("Choose a different stack_set_name, or match the existing permission model"),
                    ));
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                general.push(Issue::error(
                    format!("cannot describe stack set {}: {err}", fanout.stack_set_name),
                    Some("Grant cloudformation:DescribeStackSet to the caller"),
                ));
                false
            }
        }
    }

    fn check_targets(&self, fanout: &FanoutTargets, stack_set_exists: bool, targets: &mut [TargetReport]) {
        let enabled_regions = self.read("describe regions", || self.cloud.enabled_regions());
        if let Err(err) = &enabled_regions {
            tracing::warn!(error = %err, "cannot list enabled regions");
        }
        let mut resolved: BTreeMap<AccountSelector, Result<Vec<String>, String>> = BTreeMap::new();
        let mut active: BTreeMap<String, ReconcileResult<bool>> = BTreeMap::new();

        for report in targets.iter_mut() {
            let region = report.target.region.clone();
            match &enabled_regions {
                Ok(regions) if !regions.contains(&region) => report.issues.push(Issue::error(
                    format!("region {region} is not enabled for the caller's account"),
                    Some("Enable the region, or remove it from fanout.regions"),
                )),
                Ok(_) => {}
                Err(err) => report.issues.push(Issue::failed_read(
                    format!("cannot confirm region {region} is enabled: {err}"),
                    err,
                    Some("Grant ec2:DescribeRegions to the caller"),
                )),
            }

            let selector = report.target.account_selector.clone();
            let accounts = resolved
                .entry(selector.clone())
                .or_insert_with(|| self.resolve_selector(&selector))
                .clone();
            let accounts = match accounts {
                Ok(accounts) => accounts,
                Err(message) => {
                    report.issues.push(Issue::error(
                        message,
                        Some("Check the id, and that the caller can read AWS Organizations"),
                    ));
                    continue;
                }
            };
            if accounts.is_empty() {
                report.issues.push(Issue::warning(
                    format!("{selector} contains no accounts; nothing will be deployed"),
                    None,
                ));
            }
            for account in &accounts {
                let state = active
                    .entry(account.clone())
                    .or_insert_with(|| self.read("describe account", || self.cloud.account_is_active(account)));
                match state {
                    Ok(true) => {}
                    Ok(false) => report.issues.push(Issue::error(
                        format!("account {account} is not active"),
                        Some("Remove the account, or reactivate it"),
                    )),
                    Err(err) => report.issues.push(Issue::failed_read(
                        format!("cannot confirm account {account} is active: {err}"),
                        err,
                        Some("Grant organizations:DescribeAccount to the caller"),
                    )),
                }
                if stack_set_exists {
                    self.check_existing_instance(fanout, &selector, account, &region, &mut report.issues);
                }
            }
            report.accounts = accounts;
        }
    }

    fn resolve_selector(&self, selector: &AccountSelector) -> Result<Vec<String>, String> {
        match selector {
            AccountSelector::Account(id) => Ok(vec![id.clone()]),
            AccountSelector::OrganizationalUnit(ou) => {
                let unique: BTreeSet<String> = self
                    .read("list accounts for parent", || {
                        self.cloud.accounts_for_organizational_unit(ou)
                    })
                    .map_err(|err| format!("cannot resolve organizational unit {ou}: {}", err.message()))?
                    .into_iter()
                    .collect();
                Ok(unique.into_iter().collect())
            }
        }
    }

    fn check_existing_instance(
        &self,
        fanout: &FanoutTargets,
        selector: &AccountSelector,
        account: &str,
        region: &str,
        issues: &mut Vec<Issue>,
    ) {
        let locator = StackLocator::Instance {
            stack_set_name: fanout.stack_set_name.clone(),
            target: StackTarget::new(account, region),
            organizational_unit: match selector {
                AccountSelector::OrganizationalUnit(ou) => Some(ou.clone()),
                AccountSelector::Account(_) => None,
            },
        };
        match self.read("describe stack instance", || self.cloud.describe_stack(&locator)) {
            Ok(Some(live)) if live.phase == StackPhase::Failed => issues.push(Issue::error(
                format!("existing {locator} is {} and cannot be updated", live.status),
                Some("Delete or repair the stack instance before re-deploying"),
            )),
            Ok(Some(live)) if live.phase == StackPhase::InProgress => issues.push(Issue::warning(
                format!("{locator} has an operation in flight ({})", live.status),
                Some("Wait for the current operation to finish"),
            )),
            Ok(_) => {}
            Err(err) => issues.push(Issue::failed_read(
                format!("cannot describe {locator}: {err}"),
                &err,
                Some("Grant cloudformation:DescribeStackInstance to the caller"),
            )),
        }
    }
}

#[cfg(test)]
#[path = "preflight_tests.rs"]
mod tests;
