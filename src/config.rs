//! Desired-state file loading.
//!
//! One YAML or JSON file describes the run. Registry documents are separate
//! files referenced by path, resolved against the config file's directory.
use crate::desired::{
    AccountSelector, DesiredState, FanoutTargets, PermissionModel, RegistryDocuments,
    StackParameterKey, TemplateRef, WebhookSpec, DEFAULT_WEBHOOK_IDENTIFIER,
};
use crate::error::{ReconcileError, ReconcileResult};
use crate::util::template_digest;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_INTEGRATION_ID: &str = "aws-serverless";
pub const DEFAULT_INTEGRATION_TYPE: &str = "aws-serverless";
pub const DEFAULT_INTEGRATION_VERSION: &str = "1.0.0";
pub const DEFAULT_STACK_NAME: &str = "port-aws-serverless";
pub const DEFAULT_QUEUE_NAME: &str = "port-aws-events-queue";
pub const DEFAULT_FUNCTION_NAME: &str = "port-aws-event-processor";
pub const DEFAULT_EVENT_SOURCES: [&str; 3] = ["aws.ec2", "aws.s3", "aws.ecs"];
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_STACK_SET_NAME: &str = "port-aws-serverless";
pub const DEFAULT_EXECUTION_ROLE: &str = "AWSCloudFormationStackSetExecutionRole";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub stack: StackSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutSection>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_version: Option<String>,
    /// Identifier, absolute ingest URL, or `/v1/webhooks/<id>` path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    /// Files holding one schema definition or a list of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_mappings: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StackSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_url: Option<String>,
    /// Parameters that keep their live value on update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_previous: Vec<StackParameterKey>,
    /// Additional template parameters passed verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FanoutSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_set_name: Option<String>,
    #[serde(default)]
    pub permission_model: PermissionModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_role_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizational_units: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

pub fn load_config(path: &Path) -> Result<ProvisionConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

/// Read a JSON or YAML document; the extension picks the parser.
pub fn load_document(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn load_schemas(base_dir: &Path, paths: &[PathBuf]) -> Result<Vec<Value>> {
    let mut schemas = Vec::new();
    for path in paths {
        let resolved = resolve(base_dir, path);
        match load_document(&resolved)? {
            Value::Array(items) => schemas.extend(items),
            single => schemas.push(single),
        }
    }
    for (index, schema) in schemas.iter().enumerate() {
        let has_identifier = schema
            .get("identifier")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.trim().is_empty());
        if !has_identifier {
            return Err(anyhow!(
                "schema definition #{index} has no string `identifier`"
            ));
        }
    }
    Ok(schemas)
}

fn template_ref(base_dir: &Path, stack: &StackSection) -> Result<(TemplateRef, Option<String>)> {
    match (&stack.template, &stack.template_url) {
        (Some(_), Some(_)) => Err(anyhow!("set only one of stack.template and stack.template_url")),
        (None, Some(url)) => Ok((TemplateRef::Url(url.clone()), None)),
        (Some(path), None) => {
            let resolved = resolve(base_dir, path);
            let body = fs::read(&resolved)
                .with_context(|| format!("read template {}", resolved.display()))?;
            Ok((TemplateRef::File(resolved), Some(template_digest(&body))))
        }
        (None, None) => Err(anyhow!("stack.template or stack.template_url is required")),
    }
}

fn fanout_targets(section: &FanoutSection) -> FanoutTargets {
    let account_selectors = section
        .organizational_units
        .iter()
        .map(|ou| AccountSelector::OrganizationalUnit(ou.trim().to_string()))
        .chain(
            section
                .accounts
                .iter()
                .map(|account| AccountSelector::Account(account.trim().to_string())),
        )
        .collect();
    FanoutTargets {
        stack_set_name: or_default(&section.stack_set_name, DEFAULT_STACK_SET_NAME),
        permission_model: section.permission_model,
        admin_role_arn: section
            .admin_role_arn
            .as_deref()
            .map(str::trim)
            .filter(|arn| !arn.is_empty())
            .map(str::to_string),
        execution_role_name: or_default(&section.execution_role_name, DEFAULT_EXECUTION_ROLE),
        account_selectors,
        regions: section.regions.iter().map(|r| r.trim().to_string()).collect(),
        max_concurrency: section.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
    }
}

/// Build and validate the desired state described by `config`.
pub fn desired_state(config: &ProvisionConfig, base_dir: &Path) -> Result<DesiredState> {
    let registry = &config.registry;
    let stack = &config.stack;

    let webhook_spec = WebhookSpec::parse(
        registry
            .webhook
            .as_deref()
            .unwrap_or(DEFAULT_WEBHOOK_IDENTIFIER),
    )?;
    let schemas = load_schemas(base_dir, &registry.schemas)?;
    let mapping_config = match &registry.mapping {
        Some(path) => load_document(&resolve(base_dir, path))?,
        None => Value::Object(Default::default()),
    };
    let webhook_mappings = registry
        .webhook_mappings
        .as_ref()
        .map(|path| load_document(&resolve(base_dir, path)))
        .transpose()?;
    let (template, template_digest) = template_ref(base_dir, stack)?;

    let event_sources: BTreeSet<String> = match &stack.event_sources {
        Some(sources) => sources
            .iter()
            .map(|source| source.trim().to_string())
            .filter(|source| !source.is_empty())
            .collect(),
        None => DEFAULT_EVENT_SOURCES.iter().map(|s| s.to_string()).collect(),
    };

    let desired = DesiredState {
        registry_integration_id: or_default(&registry.integration_id, DEFAULT_INTEGRATION_ID),
        integration_type: or_default(&registry.integration_type, DEFAULT_INTEGRATION_TYPE),
        integration_version: or_default(&registry.integration_version, DEFAULT_INTEGRATION_VERSION),
        webhook_spec,
        documents: RegistryDocuments {
            schemas,
            mapping_config,
            webhook_mappings,
        },
        stack_name: or_default(&stack.name, DEFAULT_STACK_NAME),
        queue_name: or_default(&stack.queue_name, DEFAULT_QUEUE_NAME),
        function_name: or_default(&stack.function_name, DEFAULT_FUNCTION_NAME),
        event_sources,
        region_default: or_default(&stack.region, DEFAULT_REGION),
        template,
        template_digest,
        keep_previous: stack.keep_previous.iter().copied().collect(),
        extra_parameters: stack.parameters.clone(),
        fanout_targets: config.fanout.as_ref().map(fanout_targets),
    };
    validate(&desired)?;
    Ok(desired)
}

/// Invariants beyond `DesiredState::validate` that only make sense for
/// loaded files.
pub fn validate(desired: &DesiredState) -> ReconcileResult<()> {
    desired.validate()?;
    if let Some(fanout) = &desired.fanout_targets {
        if fanout.stack_set_name.trim().is_empty() {
            return Err(ReconcileError::Validation(
                "fanout.stack_set_name must be non-empty".to_string(),
            ));
        }
        if fanout.permission_model == PermissionModel::SelfManaged
            && fanout.account_selectors.is_empty()
        {
            return Err(ReconcileError::Validation(
                "self-managed fanout requires at least one account".to_string(),
            ));
        }
    }
    if !desired.documents.mapping_config.is_object() {
        return Err(ReconcileError::Validation(
            "mapping config must be an object".to_string(),
        ));
    }
    Ok(())
}

/// Load the config at `path` and build its desired state.
pub fn load_desired_state(path: &Path) -> Result<DesiredState> {
    let config = load_config(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    desired_state(&config, base_dir).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
