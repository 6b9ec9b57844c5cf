//! Desired-state value types.
//!
//! A `DesiredState` is built once per run and handed to every component by
//! shared reference; nothing downstream mutates it.
use crate::error::{ReconcileError, ReconcileResult};
use crate::util::sha256_hex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const DEFAULT_WEBHOOK_IDENTIFIER: &str = "aws_ingest";

/// Template parameter keys the cloud stack declares.
pub const PARAM_WEBHOOK_URL: &str = "PortWebhookUrl";
pub const PARAM_QUEUE_NAME: &str = "QueueName";
pub const PARAM_FUNCTION_NAME: &str = "LambdaFunctionName";
pub const PARAM_EVENT_SOURCES: &str = "SupportedEventSources";

pub const REQUIRED_PARAMETERS: [&str; 4] = [
    PARAM_WEBHOOK_URL,
    PARAM_QUEUE_NAME,
    PARAM_FUNCTION_NAME,
    PARAM_EVENT_SOURCES,
];

fn webhook_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/v1/webhooks/([A-Za-z0-9_.\-]+)/?(?:\?.*)?$").expect("valid webhook path regex")
    })
}

/// The three accepted webhook inputs, classified once when config is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WebhookSpec {
    Identifier(String),
    AbsoluteUrl(String),
    PathFragment(String),
}

impl WebhookSpec {
    pub fn parse(raw: &str) -> ReconcileResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(WebhookSpec::Identifier(DEFAULT_WEBHOOK_IDENTIFIER.to_string()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(WebhookSpec::AbsoluteUrl(raw.to_string()));
        }
        if raw.starts_with('/') {
            if webhook_path_regex().is_match(raw) {
                return Ok(WebhookSpec::PathFragment(raw.to_string()));
            }
            return Err(ReconcileError::Validation(format!(
                "webhook path {raw:?} does not match /v1/webhooks/<id>"
            )));
        }
        if raw.chars().any(|ch| ch.is_whitespace() || ch == '/' || ch == '?') {
            return Err(ReconcileError::Validation(format!(
                "webhook identifier {raw:?} contains illegal characters"
            )));
        }
        Ok(WebhookSpec::Identifier(raw.to_string()))
    }

    /// Identifier to look up, for the forms that need a registry lookup.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            WebhookSpec::Identifier(id) => Some(id.as_str()),
            WebhookSpec::PathFragment(fragment) => webhook_path_regex()
                .captures(fragment)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str()),
            WebhookSpec::AbsoluteUrl(_) => None,
        }
    }
}

impl fmt::Display for WebhookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookSpec::Identifier(value)
            | WebhookSpec::AbsoluteUrl(value)
            | WebhookSpec::PathFragment(value) => f.write_str(value),
        }
    }
}

/// Where the cloud template comes from. The template itself is opaque.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateRef {
    File(PathBuf),
    Url(String),
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateRef::File(path) => write!(f, "{}", path.display()),
            TemplateRef::Url(url) => f.write_str(url),
        }
    }
}

/// Logical stack parameters an operator may pin to their live value.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StackParameterKey {
    WebhookUrl,
    QueueName,
    FunctionName,
    EventSources,
}

impl StackParameterKey {
    pub fn template_key(&self) -> &'static str {
        match self {
            StackParameterKey::WebhookUrl => PARAM_WEBHOOK_URL,
            StackParameterKey::QueueName => PARAM_QUEUE_NAME,
            StackParameterKey::FunctionName => PARAM_FUNCTION_NAME,
            StackParameterKey::EventSources => PARAM_EVENT_SOURCES,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    Explicit(String),
    KeepPrevious,
}

/// Template parameters, keyed by template parameter name.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct StackParameters(BTreeMap<String, ParameterValue>);

impl StackParameters {
    pub fn new() -> Self {
        StackParameters(BTreeMap::new())
    }

    pub fn set(&mut self, key: &str, value: ParameterValue) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn ensure_required(&self) -> ReconcileResult<()> {
        let missing: Vec<&str> = REQUIRED_PARAMETERS
            .iter()
            .copied()
            .filter(|key| !self.0.contains_key(*key))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(ReconcileError::Validation(format!(
            "missing stack parameters: {}",
            missing.join(", ")
        )))
    }

    /// Copy with every `KeepPrevious` entry dropped, for stack creation.
    pub fn without_keep_previous(&self) -> StackParameters {
        StackParameters(
            self.0
                .iter()
                .filter(|(_, value)| matches!(value, ParameterValue::Explicit(_)))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn keep_previous_keys(&self) -> impl Iterator<Item = &String> {
        self.0
            .iter()
            .filter(|(_, value)| matches!(value, ParameterValue::KeepPrevious))
            .map(|(key, _)| key)
    }

    /// Explicit values only, for comparing against a live stack.
    pub fn explicit_values(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(key, value)| match value {
                ParameterValue::Explicit(v) => Some((key.clone(), v.clone())),
                ParameterValue::KeepPrevious => None,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AccountSelector {
    Account(String),
    OrganizationalUnit(String),
}

impl fmt::Display for AccountSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountSelector::Account(id) => write!(f, "account {id}"),
            AccountSelector::OrganizationalUnit(id) => write!(f, "ou {id}"),
        }
    }
}

/// One (selector, region) pair before selectors are resolved to accounts.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FanoutTarget {
    pub account_selector: AccountSelector,
    pub region: String,
}

/// Concrete StackInstance identity: a resolved account in one region.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackTarget {
    pub account_id: String,
    pub region: String,
}

impl StackTarget {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        StackTarget {
            account_id: account_id.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for StackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.region)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionModel {
    #[default]
    ServiceManaged,
    SelfManaged,
}

impl PermissionModel {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            PermissionModel::ServiceManaged => "SERVICE_MANAGED",
            PermissionModel::SelfManaged => "SELF_MANAGED",
        }
    }
}

/// Multi-account section of the desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutTargets {
    pub stack_set_name: String,
    pub permission_model: PermissionModel,
    pub admin_role_arn: Option<String>,
    pub execution_role_name: String,
    pub account_selectors: Vec<AccountSelector>,
    pub regions: Vec<String>,
    pub max_concurrency: usize,
}

impl FanoutTargets {
    /// Set-product of selectors and regions, deduplicated and ordered.
    pub fn targets(&self) -> Vec<FanoutTarget> {
        let mut product = BTreeSet::new();
        for selector in &self.account_selectors {
            for region in &self.regions {
                product.insert(FanoutTarget {
                    account_selector: selector.clone(),
                    region: region.clone(),
                });
            }
        }
        product.into_iter().collect()
    }
}

/// Opaque registry documents the reconciler uploads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryDocuments {
    pub schemas: Vec<Value>,
    pub mapping_config: Value,
    pub webhook_mappings: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredState {
    pub registry_integration_id: String,
    pub integration_type: String,
    pub integration_version: String,
    pub webhook_spec: WebhookSpec,
    pub documents: RegistryDocuments,
    pub stack_name: String,
    pub queue_name: String,
    pub function_name: String,
    pub event_sources: BTreeSet<String>,
    pub region_default: String,
    pub template: TemplateRef,
    /// SHA-256 of a local template body; `None` for remote templates.
    pub template_digest: Option<String>,
    pub keep_previous: BTreeSet<StackParameterKey>,
    pub extra_parameters: BTreeMap<String, String>,
    pub fanout_targets: Option<FanoutTargets>,
}

impl DesiredState {
    /// Check invariants that every run relies on.
    pub fn validate(&self) -> ReconcileResult<()> {
        if self.event_sources.is_empty() {
            return Err(ReconcileError::Validation(
                "event_sources must be non-empty".to_string(),
            ));
        }
        for (label, value) in [
            ("registry integration id", &self.registry_integration_id),
            ("stack name", &self.stack_name),
            ("queue name", &self.queue_name),
            ("function name", &self.function_name),
            ("default region", &self.region_default),
        ] {
            if value.trim().is_empty() {
                return Err(ReconcileError::Validation(format!("{label} must be non-empty")));
            }
        }
        if let WebhookSpec::Identifier(_) | WebhookSpec::PathFragment(_) = &self.webhook_spec {
            if self.webhook_spec.identifier().is_none() {
                return Err(ReconcileError::Validation(format!(
                    "webhook {} does not resolve to an identifier",
                    self.webhook_spec
                )));
            }
        }
        if let Some(fanout) = &self.fanout_targets {
            if fanout.regions.is_empty() {
                return Err(ReconcileError::Validation(
                    "fanout requires at least one region".to_string(),
                ));
            }
            if fanout.max_concurrency == 0 {
                return Err(ReconcileError::Validation(
                    "fanout max_concurrency must be at least 1".to_string(),
                ));
            }
            if fanout.permission_model == PermissionModel::SelfManaged {
                if fanout.admin_role_arn.is_none() {
                    return Err(ReconcileError::Validation(
                        "self-managed fanout requires admin_role_arn".to_string(),
                    ));
                }
                if fanout
                    .account_selectors
                    .iter()
                    .any(|s| matches!(s, AccountSelector::OrganizationalUnit(_)))
                {
                    return Err(ReconcileError::Validation(
                        "self-managed fanout targets accounts, not organizational units"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn event_sources_csv(&self) -> String {
        self.event_sources
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Resolve stack parameters once the webhook URL is known.
    pub fn stack_parameters(&self, webhook_url: &str) -> StackParameters {
        let mut params = StackParameters::new();
        for (key, value) in &self.extra_parameters {
            params.set(key, ParameterValue::Explicit(value.clone()));
        }
        let explicit = [
            (StackParameterKey::WebhookUrl, webhook_url.to_string()),
            (StackParameterKey::QueueName, self.queue_name.clone()),
            (StackParameterKey::FunctionName, self.function_name.clone()),
            (StackParameterKey::EventSources, self.event_sources_csv()),
        ];
        for (key, value) in explicit {
            let resolved = if self.keep_previous.contains(&key) {
                ParameterValue::KeepPrevious
            } else {
                ParameterValue::Explicit(value)
            };
            params.set(key.template_key(), resolved);
        }
        params
    }

    /// Stable digest of everything a fan-out would deploy, used to tie a
    /// preflight clearance to the exact input it validated.
    pub fn stack_fingerprint(&self, targets: &[FanoutTarget]) -> String {
        let view = serde_json::json!({
            "stack_name": self.stack_name,
            "queue_name": self.queue_name,
            "function_name": self.function_name,
            "event_sources": self.event_sources,
            "template": self.template,
            "template_digest": self.template_digest,
            "keep_previous": self.keep_previous,
            "extra_parameters": self.extra_parameters,
            "fanout": self.fanout_targets,
            "targets": targets,
        });
        sha256_hex(view.to_string().as_bytes())
    }
}

#[cfg(test)]
#[path = "desired_tests.rs"]
mod tests;
