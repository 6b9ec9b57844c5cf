//! `CloudApi` over the AWS CLI.
//!
//! Each call is one `aws <service> <operation> ... --output json` subprocess.
//! Failures are classified from the `An error occurred (Code)` line the CLI
//! prints on stderr.
use super::{
    CallerIdentity, CloudApi, EventSourceMapping, MutationReceipt, StackDescription, StackLocator,
    StackPhase, StackSetDescription, StackSetSpec, TemplateParameter, UpdateOutcome,
};
use crate::desired::{ParameterValue, PermissionModel, StackParameters, TemplateRef};
use crate::error::{ReconcileError, ReconcileResult};
use crate::util::{canonical_json_digest, elapsed_ms, template_digest, truncate_string};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Instant;

const CAPABILITIES: &str = "CAPABILITY_NAMED_IAM";
const STACK_SETS_SERVICE_PRINCIPAL: &str = "stacksets.cloudformation.amazonaws.com";
const NO_UPDATES_MESSAGE: &str = "No updates are to be performed";
const MAX_OU_DEPTH: usize = 5;
const STDERR_MAX_BYTES: usize = 600;

const AUTH_CODES: [&str; 4] = [
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
];
const PERMISSION_CODES: [&str; 5] = [
    "AccessDenied",
    "AccessDeniedException",
    "AuthorizationError",
    "UnauthorizedOperation",
    "AccessDeniedForDependencyException",
];
const VALIDATION_CODES: [&str; 6] = [
    "ValidationError",
    "ValidationException",
    "InvalidParameterValue",
    "InvalidParameterValueException",
    "InsufficientCapabilitiesException",
    "InvalidOperationException",
];
const CONFLICT_CODES: [&str; 5] = [
    "AlreadyExistsException",
    "NameAlreadyExistsException",
    "ResourceConflictException",
    "CreatedButModifiedException",
    "OperationInProgressException",
];
const TRANSIENT_CODES: [&str; 10] = [
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "InternalError",
    "RequestTimeout",
    "StaleRequestException",
];

fn cli_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"An error occurred \(([A-Za-z0-9_.]+)\).*? when calling the (\w+) operation(?: \([^)]*\))?: (.*)",
        )
        .expect("valid aws cli error regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCliSettings {
    /// Command prefix, e.g. `aws` or `aws --profile ops`.
    pub command: String,
    /// Region for account-level and stack-set administration calls.
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliFailure {
    code: Option<String>,
    message: String,
}

impl CliFailure {
    fn code_is(&self, codes: &[&str]) -> bool {
        self.code.as_deref().is_some_and(|code| codes.contains(&code))
    }

    fn into_error(self, context: &str) -> ReconcileError {
        let message = format!("{context}: {}", self.message);
        let Some(code) = self.code.as_deref() else {
            let lowered = self.message.to_ascii_lowercase();
            if lowered.contains("could not connect")
                || lowered.contains("timed out")
                || lowered.contains("connection was closed")
            {
                return ReconcileError::Transient(message);
            }
            return ReconcileError::Fatal(message);
        };
        if AUTH_CODES.contains(&code) {
            ReconcileError::Auth(message)
        } else if PERMISSION_CODES.contains(&code) {
            ReconcileError::Permission(message)
        } else if VALIDATION_CODES.contains(&code) {
            ReconcileError::Validation(message)
        } else if CONFLICT_CODES.contains(&code) {
            ReconcileError::Conflict(message)
        } else if TRANSIENT_CODES.contains(&code) {
            ReconcileError::Transient(message)
        } else {
            ReconcileError::Fatal(message)
        }
    }
}

fn parse_cli_failure(stderr: &str) -> CliFailure {
    let trimmed = stderr.trim();
    if let Some(caps) = cli_error_regex().captures(trimmed) {
        return CliFailure {
            code: caps.get(1).map(|m| m.as_str().to_string()),
            message: format!(
                "{} ({}): {}",
                caps.get(2).map(|m| m.as_str()).unwrap_or_default(),
                caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
                caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default()
            ),
        };
    }
    let line = trimmed
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("aws cli failed without output");
    CliFailure {
        code: None,
        message: truncate_string(line, STDERR_MAX_BYTES),
    }
}

pub struct AwsCli {
    program: String,
    base_args: Vec<String>,
    region: String,
}

impl AwsCli {
    pub fn new(settings: &AwsCliSettings) -> ReconcileResult<Self> {
        let mut parts = shell_words::split(&settings.command).map_err(|err| {
            ReconcileError::Validation(format!("parse aws command {:?}: {err}", settings.command))
        })?;
        if parts.is_empty() {
            return Err(ReconcileError::Validation("aws command is empty".to_string()));
        }
        let program = parts.remove(0);
        Ok(AwsCli {
            program,
            base_args: parts,
            region: settings.region.clone(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn invoke(&self, region: &str, args: &[&str]) -> ReconcileResult<Result<Value, CliFailure>> {
        let label = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .args(["--region", region, "--output", "json"])
            .output()
            .map_err(|err| ReconcileError::Fatal(format!("run {} {label}: {err}", self.program)))?;
        tracing::info!(
            elapsed_ms = elapsed_ms(started),
            call = %label,
            region,
            stdout_bytes = output.stdout.len(),
            "aws cli call complete"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(Err(parse_cli_failure(&stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Ok(Value::Null));
        }
        let value = serde_json::from_str(&stdout).map_err(|err| {
            ReconcileError::Fatal(format!("{label} returned invalid JSON: {err}"))
        })?;
        Ok(Ok(value))
    }

    fn call(&self, region: &str, args: &[&str]) -> ReconcileResult<Value> {
        let label = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        self.invoke(region, args)?
            .map_err(|failure| failure.into_error(&label))
    }

    /// Like `call`, but a failure matching `missing` means the resource is absent.
    fn call_optional<F>(&self, region: &str, args: &[&str], missing: F) -> ReconcileResult<Option<Value>>
    where
        F: Fn(&CliFailure) -> bool,
    {
        let label = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        match self.invoke(region, args)? {
            Ok(value) => Ok(Some(value)),
            Err(failure) if missing(&failure) => Ok(None),
            Err(failure) => Err(failure.into_error(&label)),
        }
    }

    fn deployment_targets(locator_ou: Option<&str>, account_id: &str) -> String {
        match locator_ou {
            Some(ou) => json!({
                "OrganizationalUnitIds": [ou],
                "Accounts": [account_id],
                "AccountFilterType": "INTERSECTION",
            })
            .to_string(),
            None => json!({ "Accounts": [account_id] }).to_string(),
        }
    }

    fn stack_set_args(spec: &StackSetSpec, operation: &str, parameters: &str) -> Vec<String> {
        let (template_flag, template_value) = template_args(&spec.template);
        let mut args = vec![
            "cloudformation".to_string(),
            operation.to_string(),
            "--stack-set-name".to_string(),
            spec.name.clone(),
            template_flag.to_string(),
            template_value,
            "--parameters".to_string(),
            parameters.to_string(),
            "--capabilities".to_string(),
            CAPABILITIES.to_string(),
            "--managed-execution".to_string(),
            "Active=true".to_string(),
        ];
        if operation == "create-stack-set" {
            args.push("--permission-model".to_string());
            args.push(spec.permission_model.as_api_str().to_string());
            if spec.permission_model == PermissionModel::ServiceManaged {
                args.push("--auto-deployment".to_string());
                args.push("Enabled=false".to_string());
            }
        }
        if spec.permission_model == PermissionModel::SelfManaged {
            if let Some(arn) = &spec.admin_role_arn {
                args.push("--administration-role-arn".to_string());
                args.push(arn.clone());
            }
            args.push("--execution-role-name".to_string());
            args.push(spec.execution_role_name.clone());
        }
        args
    }
}

fn template_args(template: &TemplateRef) -> (&'static str, String) {
    match template {
        TemplateRef::File(path) => ("--template-body", format!("file://{}", path.display())),
        TemplateRef::Url(url) => ("--template-url", url.clone()),
    }
}

/// CloudFormation parameter list as JSON; values may contain commas.
fn render_parameters(parameters: &StackParameters) -> String {
    let entries: Vec<Value> = parameters
        .iter()
        .map(|(key, value)| match value {
            ParameterValue::Explicit(value) => json!({"ParameterKey": key, "ParameterValue": value}),
            ParameterValue::KeepPrevious => json!({"ParameterKey": key, "UsePreviousValue": true}),
        })
        .collect();
    Value::Array(entries).to_string()
}

fn string_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn pairs(value: Option<&Value>, key_field: &str, value_field: &str) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some((
                        item.get(key_field)?.as_str()?.to_string(),
                        item.get(value_field)?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(value: &Value, array_pointer: &str, field: &str) -> Vec<String> {
    value
        .pointer(array_pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Map a standalone stack status; `None` means the stack was deleted.
pub(crate) fn stack_phase(status: &str) -> Option<StackPhase> {
    if status == "DELETE_COMPLETE" {
        return None;
    }
    let phase = if status.ends_with("_IN_PROGRESS") {
        StackPhase::InProgress
    } else {
        match status {
            "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => StackPhase::Complete,
            "UPDATE_ROLLBACK_COMPLETE" | "IMPORT_ROLLBACK_COMPLETE" => StackPhase::RolledBack,
            _ => StackPhase::Failed,
        }
    };
    Some(phase)
}

/// Map a stack instance status and its detailed status.
pub(crate) fn instance_phase(status: &str, detailed: Option<&str>) -> StackPhase {
    match (status, detailed) {
        (_, Some("PENDING" | "RUNNING")) => StackPhase::InProgress,
        ("CURRENT", _) => StackPhase::Complete,
        ("INOPERABLE", _) => StackPhase::Failed,
        _ => StackPhase::RolledBack,
    }
}

/// Digest of a live template body. The CLI decodes JSON bodies into objects
/// and returns YAML bodies as strings.
fn template_body_digest(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(body) => Some(template_digest(body.as_bytes())),
        body @ Value::Object(_) => Some(canonical_json_digest(body)),
        _ => None,
    }
}

/// Map a stack set operation status.
pub(crate) fn operation_phase(status: &str) -> StackPhase {
    match status {
        "SUCCEEDED" => StackPhase::Complete,
        "FAILED" | "STOPPED" => StackPhase::Failed,
        _ => StackPhase::InProgress,
    }
}

impl AwsCli {
    fn describe_standalone(&self, stack_name: &str, region: &str) -> ReconcileResult<Option<StackDescription>> {
        let described = self.call_optional(
            region,
            &["cloudformation", "describe-stacks", "--stack-name", stack_name],
            |failure| failure.code_is(&["ValidationError"]) && failure.message.contains("does not exist"),
        )?;
        let Some(stack) = described.as_ref().and_then(|value| value.pointer("/Stacks/0")) else {
            return Ok(None);
        };
        let status = stack
            .get("StackStatus")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(phase) = stack_phase(&status) else {
            return Ok(None);
        };
        let template = self.call(
            region,
            &[
                "cloudformation",
                "get-template",
                "--stack-name",
                stack_name,
                "--template-stage",
                "Original",
            ],
        )?;
        Ok(Some(StackDescription {
            status,
            phase,
            parameters: pairs(stack.get("Parameters"), "ParameterKey", "ParameterValue"),
            outputs: pairs(stack.get("Outputs"), "OutputKey", "OutputValue"),
            template_digest: template_body_digest(&template, "/TemplateBody"),
        }))
    }

    fn describe_instance(
        &self,
        stack_set_name: &str,
        account_id: &str,
        region: &str,
    ) -> ReconcileResult<Option<StackDescription>> {
        let described = self.call_optional(
            &self.region,
            &[
                "cloudformation",
                "describe-stack-instance",
                "--stack-set-name",
                stack_set_name,
                "--stack-instance-account",
                account_id,
                "--stack-instance-region",
                region,
            ],
            |failure| {
                failure.code_is(&["StackInstanceNotFoundException", "StackSetNotFoundException"])
            },
        )?;
        let Some(instance) = described.as_ref().and_then(|value| value.get("StackInstance")) else {
            return Ok(None);
        };
        let status = instance
            .get("Status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let detailed = string_at(instance, "/StackInstanceStatus/DetailedStatus");
        // Overrides only list what differs from the stack set.
        let mut parameters = self
            .describe_stack_set(stack_set_name)?
            .map(|stack_set| stack_set.parameters)
            .unwrap_or_default();
        parameters.extend(pairs(instance.get("ParameterOverrides"), "ParameterKey", "ParameterValue"));
        Ok(Some(StackDescription {
            phase: instance_phase(&status, detailed),
            status: match detailed {
                Some(detail) => format!("{status}/{detail}"),
                None => status,
            },
            parameters,
            outputs: BTreeMap::new(),
            template_digest: None,
        }))
    }

    fn collect_ou_accounts(&self, ou_id: &str, depth: usize, out: &mut Vec<String>) -> ReconcileResult<()> {
        let accounts = self.call(
            &self.region,
            &["organizations", "list-accounts-for-parent", "--parent-id", ou_id],
        )?;
        out.extend(string_list(&accounts, "/Accounts", "Id"));
        if depth >= MAX_OU_DEPTH {
            return Ok(());
        }
        let children = self.call(
            &self.region,
            &["organizations", "list-organizational-units-for-parent", "--parent-id", ou_id],
        )?;
        for child in string_list(&children, "/OrganizationalUnits", "Id") {
            self.collect_ou_accounts(&child, depth + 1, out)?;
        }
        Ok(())
    }
}

impl CloudApi for AwsCli {
    fn describe_stack(&self, locator: &StackLocator) -> ReconcileResult<Option<StackDescription>> {
        match locator {
            StackLocator::Stack { stack_name, target } => {
                self.describe_standalone(stack_name, &target.region)
            }
            StackLocator::Instance {
                stack_set_name,
                target,
                ..
            } => self.describe_instance(stack_set_name, &target.account_id, &target.region),
        }
    }

    fn create_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<MutationReceipt> {
        let rendered = render_parameters(parameters);
        match locator {
            StackLocator::Stack { stack_name, target } => {
                let (template_flag, template_value) = template_args(template);
                let created = self.call(
                    &target.region,
                    &[
                        "cloudformation",
                        "create-stack",
                        "--stack-name",
                        stack_name,
                        template_flag,
                        &template_value,
                        "--parameters",
                        &rendered,
                        "--capabilities",
                        CAPABILITIES,
                    ],
                )?;
                Ok(MutationReceipt::sent(string_at(&created, "/StackId").map(str::to_string)))
            }
            StackLocator::Instance {
                stack_set_name,
                target,
                organizational_unit,
            } => {
                let targets = Self::deployment_targets(organizational_unit.as_deref(), &target.account_id);
                let created = self.call(
                    &self.region,
                    &[
                        "cloudformation",
                        "create-stack-instances",
                        "--stack-set-name",
                        stack_set_name,
                        "--deployment-targets",
                        &targets,
                        "--regions",
                        &target.region,
                        "--parameter-overrides",
                        &rendered,
                    ],
                )?;
                Ok(MutationReceipt::sent(string_at(&created, "/OperationId").map(str::to_string)))
            }
        }
    }

    fn update_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<UpdateOutcome> {
        let rendered = render_parameters(parameters);
        match locator {
            StackLocator::Stack { stack_name, target } => {
                let (template_flag, template_value) = template_args(template);
                let args: [&str; 10] = [
                    "cloudformation",
                    "update-stack",
                    "--stack-name",
                    stack_name,
                    template_flag,
                    &template_value,
                    "--parameters",
                    &rendered,
                    "--capabilities",
                    CAPABILITIES,
                ];
                match self.invoke(&target.region, &args)? {
                    Ok(updated) => Ok(UpdateOutcome::Started(MutationReceipt::sent(
                        string_at(&updated, "/StackId").map(str::to_string),
                    ))),
                    Err(failure) if failure.message.contains(NO_UPDATES_MESSAGE) => {
                        Ok(UpdateOutcome::NoChanges)
                    }
                    Err(failure) => Err(failure.into_error("cloudformation update-stack")),
                }
            }
            StackLocator::Instance {
                stack_set_name,
                target,
                organizational_unit,
            } => {
                let targets = Self::deployment_targets(organizational_unit.as_deref(), &target.account_id);
                let updated = self.call(
                    &self.region,
                    &[
                        "cloudformation",
                        "update-stack-instances",
                        "--stack-set-name",
                        stack_set_name,
                        "--deployment-targets",
                        &targets,
                        "--regions",
                        &target.region,
                        "--parameter-overrides",
                        &rendered,
                    ],
                )?;
                Ok(UpdateOutcome::Started(MutationReceipt::sent(
                    string_at(&updated, "/OperationId").map(str::to_string),
                )))
            }
        }
    }

    fn stack_failure_reason(&self, locator: &StackLocator) -> ReconcileResult<Option<String>> {
        match locator {
            StackLocator::Stack { stack_name, target } => {
                let events = self.call(
                    &target.region,
                    &["cloudformation", "describe-stack-events", "--stack-name", stack_name],
                )?;
                let reason = events
                    .get("StackEvents")
                    .and_then(Value::as_array)
                    .and_then(|events| {
                        // Newest first; the earliest failure is the root cause.
                        events.iter().rev().find_map(|event| {
                            let status = event.get("ResourceStatus")?.as_str()?;
                            let reason = event.get("ResourceStatusReason")?.as_str()?;
                            (status.ends_with("_FAILED") && !reason.is_empty()).then(|| {
                                let resource = event
                                    .get("LogicalResourceId")
                                    .and_then(Value::as_str)
                                    .unwrap_or("stack");
                                format!("{resource}: {reason}")
                            })
                        })
                    });
                Ok(reason)
            }
            StackLocator::Instance {
                stack_set_name,
                target,
                ..
            } => {
                let described = self.call(
                    &self.region,
                    &[
                        "cloudformation",
                        "describe-stack-instance",
                        "--stack-set-name",
                        stack_set_name,
                        "--stack-instance-account",
                        &target.account_id,
                        "--stack-instance-region",
                        &target.region,
                    ],
                )?;
                Ok(string_at(&described, "/StackInstance/StatusReason").map(str::to_string))
            }
        }
    }

    fn caller_identity(&self) -> ReconcileResult<CallerIdentity> {
        let identity = self.call(&self.region, &["sts", "get-caller-identity"])?;
        let account_id = string_at(&identity, "/Account")
            .ok_or_else(|| ReconcileError::Fatal("sts returned no account id".to_string()))?;
        Ok(CallerIdentity {
            account_id: account_id.to_string(),
            arn: string_at(&identity, "/Arn").unwrap_or_default().to_string(),
        })
    }

    fn management_account_id(&self) -> ReconcileResult<Option<String>> {
        let organization = self.call_optional(
            &self.region,
            &["organizations", "describe-organization"],
            |failure| failure.code_is(&["AWSOrganizationsNotInUseException"]),
        )?;
        Ok(organization.and_then(|org| {
            string_at(&org, "/Organization/MasterAccountId")
                .or_else(|| string_at(&org, "/Organization/ManagementAccountId"))
                .map(str::to_string)
        }))
    }

    fn is_delegated_stack_set_admin(&self, account_id: &str) -> ReconcileResult<bool> {
        let delegated = self.call(
            &self.region,
            &[
                "organizations",
                "list-delegated-administrators",
                "--service-principal",
                STACK_SETS_SERVICE_PRINCIPAL,
            ],
        )?;
        Ok(string_list(&delegated, "/DelegatedAdministrators", "Id")
            .iter()
            .any(|id| id == account_id))
    }

    fn stack_set_trusted_access_enabled(&self) -> ReconcileResult<bool> {
        let access = self.call(
            &self.region,
            &["organizations", "list-aws-service-access-for-organization"],
        )?;
        Ok(string_list(&access, "/EnabledServicePrincipals", "ServicePrincipal")
            .iter()
            .any(|principal| principal == STACK_SETS_SERVICE_PRINCIPAL))
    }

    fn role_exists(&self, role_arn: &str) -> ReconcileResult<bool> {
        let role_name = role_arn.rsplit('/').next().unwrap_or(role_arn);
        let role = self.call_optional(
            &self.region,
            &["iam", "get-role", "--role-name", role_name],
            |failure| failure.code_is(&["NoSuchEntity", "NoSuchEntityException"]),
        )?;
        Ok(role.is_some())
    }

    fn list_stack_sets(&self) -> ReconcileResult<Vec<String>> {
        let listed = self.call(
            &self.region,
            &["cloudformation", "list-stack-sets", "--status", "ACTIVE"],
        )?;
        Ok(string_list(&listed, "/Summaries", "StackSetName"))
    }

    fn describe_stack_set(&self, name: &str) -> ReconcileResult<Option<StackSetDescription>> {
        let described = self.call_optional(
            &self.region,
            &["cloudformation", "describe-stack-set", "--stack-set-name", name],
            |failure| failure.code_is(&["StackSetNotFoundException"]),
        )?;
        let Some(described) = described else {
            return Ok(None);
        };
        let permission_model = match string_at(&described, "/StackSet/PermissionModel") {
            Some("SELF_MANAGED") => PermissionModel::SelfManaged,
            _ => PermissionModel::ServiceManaged,
        };
        Ok(Some(StackSetDescription {
            permission_model,
            template_digest: template_body_digest(&described, "/StackSet/TemplateBody"),
            parameters: pairs(
                described.pointer("/StackSet/Parameters"),
                "ParameterKey",
                "ParameterValue",
            ),
        }))
    }

    fn validate_template(&self, template: &TemplateRef) -> ReconcileResult<Vec<TemplateParameter>> {
        let (template_flag, template_value) = template_args(template);
        let validated = self.call(
            &self.region,
            &["cloudformation", "validate-template", template_flag, &template_value],
        )?;
        Ok(validated
            .get("Parameters")
            .and_then(Value::as_array)
            .map(|params| {
                params
                    .iter()
                    .filter_map(|param| {
                        Some(TemplateParameter {
                            key: param.get("ParameterKey")?.as_str()?.to_string(),
                            has_default: param.get("DefaultValue").is_some(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn enabled_regions(&self) -> ReconcileResult<BTreeSet<String>> {
        let regions = self.call(&self.region, &["ec2", "describe-regions"])?;
        Ok(string_list(&regions, "/Regions", "RegionName").into_iter().collect())
    }

    fn accounts_for_organizational_unit(&self, ou_id: &str) -> ReconcileResult<Vec<String>> {
        let mut accounts = Vec::new();
        self.collect_ou_accounts(ou_id, 0, &mut accounts)?;
        Ok(accounts)
    }

    fn account_is_active(&self, account_id: &str) -> ReconcileResult<bool> {
        let account = self.call_optional(
            &self.region,
            &["organizations", "describe-account", "--account-id", account_id],
            |failure| failure.code_is(&["AccountNotFoundException"]),
        )?;
        Ok(account.is_some_and(|account| {
            let status = string_at(&account, "/Account/Status")
                .or_else(|| string_at(&account, "/Account/State"));
            status == Some("ACTIVE")
        }))
    }

    fn create_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt> {
        let parameters = render_parameters(&spec.parameters.without_keep_previous());
        let args = Self::stack_set_args(spec, "create-stack-set", &parameters);
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        let created = self.call(&self.region, &borrowed)?;
        Ok(MutationReceipt::sent(string_at(&created, "/StackSetId").map(str::to_string)))
    }

    fn update_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt> {
        let parameters = render_parameters(&spec.parameters);
        let args = Self::stack_set_args(spec, "update-stack-set", &parameters);
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        let updated = self.call(&self.region, &borrowed)?;
        Ok(MutationReceipt::sent(string_at(&updated, "/OperationId").map(str::to_string)))
    }

    fn stack_set_operation_phase(
        &self,
        stack_set_name: &str,
        operation_id: &str,
    ) -> ReconcileResult<StackPhase> {
        let described = self.call(
            &self.region,
            &[
                "cloudformation",
                "describe-stack-set-operation",
                "--stack-set-name",
                stack_set_name,
                "--operation-id",
                operation_id,
            ],
        )?;
        Ok(operation_phase(
            string_at(&described, "/StackSetOperation/Status").unwrap_or_default(),
        ))
    }

    fn queue_arn(&self, queue_name: &str, region: &str) -> ReconcileResult<Option<String>> {
        let queue = self.call_optional(
            region,
            &["sqs", "get-queue-url", "--queue-name", queue_name],
            |failure| {
                failure.code_is(&[
                    "AWS.SimpleQueueService.NonExistentQueue",
                    "QueueDoesNotExist",
                ])
            },
        )?;
        let Some(queue_url) = queue.as_ref().and_then(|q| string_at(q, "/QueueUrl")) else {
            return Ok(None);
        };
        let attributes = self.call(
            region,
            &[
                "sqs",
                "get-queue-attributes",
                "--queue-url",
                queue_url,
                "--attribute-names",
                "QueueArn",
            ],
        )?;
        Ok(string_at(&attributes, "/Attributes/QueueArn").map(str::to_string))
    }

    fn function_arn(&self, function_name: &str, region: &str) -> ReconcileResult<Option<String>> {
        let function = self.call_optional(
            region,
            &["lambda", "get-function", "--function-name", function_name],
            |failure| failure.code_is(&["ResourceNotFoundException"]),
        )?;
        Ok(function
            .as_ref()
            .and_then(|f| string_at(f, "/Configuration/FunctionArn"))
            .map(str::to_string))
    }

    fn event_rule_state(&self, rule_name: &str, region: &str) -> ReconcileResult<Option<String>> {
        let rule = self.call_optional(
            region,
            &["events", "describe-rule", "--name", rule_name],
            |failure| failure.code_is(&["ResourceNotFoundException"]),
        )?;
        Ok(rule
            .as_ref()
            .and_then(|r| string_at(r, "/State"))
            .map(str::to_string))
    }

    fn event_source_mappings(
        &self,
        function_name: &str,
        region: &str,
    ) -> ReconcileResult<Vec<EventSourceMapping>> {
        let listed = self.call(
            region,
            &["lambda", "list-event-source-mappings", "--function-name", function_name],
        )?;
        Ok(listed
            .get("EventSourceMappings")
            .and_then(Value::as_array)
            .map(|mappings| {
                mappings
                    .iter()
                    .filter_map(|mapping| {
                        let state = mapping.get("State")?.as_str()?;
                        Some(EventSourceMapping {
                            uuid: mapping.get("UUID")?.as_str()?.to_string(),
                            source_arn: mapping.get("EventSourceArn")?.as_str()?.to_string(),
                            enabled: matches!(state, "Enabled" | "Enabling" | "Creating" | "Updating"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create_event_source_mapping(
        &self,
        function_name: &str,
        queue_arn: &str,
        region: &str,
    ) -> ReconcileResult<MutationReceipt> {
        let created = self.call(
            region,
            &[
                "lambda",
                "create-event-source-mapping",
                "--function-name",
                function_name,
                "--event-source-arn",
                queue_arn,
                "--batch-size",
                "10",
            ],
        )?;
        Ok(MutationReceipt::sent(string_at(&created, "/UUID").map(str::to_string)))
    }

    fn enable_event_source_mapping(&self, uuid: &str, region: &str) -> ReconcileResult<MutationReceipt> {
        self.call(
            region,
            &["lambda", "update-event-source-mapping", "--uuid", uuid, "--enabled"],
        )?;
        Ok(MutationReceipt::sent(Some(uuid.to_string())))
    }
}
