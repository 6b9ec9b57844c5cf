//! Cloud control plane: stacks, stack sets, and the read probes preflight
//! relies on.
//!
//! `CloudApi` is `Sync` because fan-out workers share one adapter.
mod aws_cli;
mod stack;
mod wiring;

pub use aws_cli::{AwsCli, AwsCliSettings};
pub use stack::{SettleSettings, SingleStackReconciler, StackRequest};
pub use wiring::{MappingAction, WiringChecker, WiringReport, RULE_NAME_OUTPUT};

use crate::desired::{PermissionModel, StackParameters, StackTarget, TemplateRef};
use crate::error::ReconcileResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where one stack lives: a standalone stack, or an instance of a stack set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackLocator {
    Stack {
        stack_name: String,
        target: StackTarget,
    },
    Instance {
        stack_set_name: String,
        target: StackTarget,
        /// Deployment OU for service-managed stack sets.
        organizational_unit: Option<String>,
    },
}

impl StackLocator {
    pub fn target(&self) -> &StackTarget {
        match self {
            StackLocator::Stack { target, .. } | StackLocator::Instance { target, .. } => target,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StackLocator::Stack { stack_name, .. } => stack_name,
            StackLocator::Instance { stack_set_name, .. } => stack_set_name,
        }
    }
}

impl fmt::Display for StackLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackLocator::Stack { stack_name, target } => write!(f, "stack {stack_name} in {target}"),
            StackLocator::Instance {
                stack_set_name,
                target,
                ..
            } => write!(f, "instance of {stack_set_name} in {target}"),
        }
    }
}

/// Coarse lifecycle phase derived from the provider's raw status.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackPhase {
    /// Another operation is in flight.
    InProgress,
    Complete,
    /// Stable, but the last update was rolled back.
    RolledBack,
    /// Not updatable without operator intervention.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub status: String,
    pub phase: StackPhase,
    pub parameters: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub template_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReceipt {
    pub operation_id: Option<String>,
    /// Recorded by a dry run; nothing was sent.
    pub simulated: bool,
}

impl MutationReceipt {
    pub fn sent(operation_id: Option<String>) -> Self {
        MutationReceipt {
            operation_id,
            simulated: false,
        }
    }

    pub fn simulated() -> Self {
        MutationReceipt {
            operation_id: None,
            simulated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Started(MutationReceipt),
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParameter {
    pub key: String,
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSetDescription {
    pub permission_model: PermissionModel,
    pub template_digest: Option<String>,
    /// Stack set parameter values; instances inherit them unless overridden.
    pub parameters: BTreeMap<String, String>,
}

/// Everything needed to create or update a stack set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSetSpec {
    pub name: String,
    pub template: TemplateRef,
    pub parameters: StackParameters,
    pub permission_model: PermissionModel,
    pub admin_role_arn: Option<String>,
    pub execution_role_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSourceMapping {
    pub uuid: String,
    pub source_arn: String,
    pub enabled: bool,
}

pub trait CloudApi: Sync {
    fn describe_stack(&self, locator: &StackLocator) -> ReconcileResult<Option<StackDescription>>;
    fn create_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<MutationReceipt>;
    /// `KeepPrevious` parameters are sent as "use previous value".
    fn update_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<UpdateOutcome>;
    /// First failure reason from the stack's event history.
    fn stack_failure_reason(&self, locator: &StackLocator) -> ReconcileResult<Option<String>>;

    fn caller_identity(&self) -> ReconcileResult<CallerIdentity>;
    /// Management account id, or `None` outside an organization.
    fn management_account_id(&self) -> ReconcileResult<Option<String>>;
    fn is_delegated_stack_set_admin(&self, account_id: &str) -> ReconcileResult<bool>;
    fn stack_set_trusted_access_enabled(&self) -> ReconcileResult<bool>;
    fn role_exists(&self, role_arn: &str) -> ReconcileResult<bool>;
    fn list_stack_sets(&self) -> ReconcileResult<Vec<String>>;
    fn describe_stack_set(&self, name: &str) -> ReconcileResult<Option<StackSetDescription>>;
    fn validate_template(&self, template: &TemplateRef) -> ReconcileResult<Vec<TemplateParameter>>;
    fn enabled_regions(&self) -> ReconcileResult<BTreeSet<String>>;
    fn accounts_for_organizational_unit(&self, ou_id: &str) -> ReconcileResult<Vec<String>>;
    fn account_is_active(&self, account_id: &str) -> ReconcileResult<bool>;
    fn create_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt>;
    fn update_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt>;
    /// Phase of a stack set operation started by `update_stack_set`.
    fn stack_set_operation_phase(
        &self,
        stack_set_name: &str,
        operation_id: &str,
    ) -> ReconcileResult<StackPhase>;

    fn queue_arn(&self, queue_name: &str, region: &str) -> ReconcileResult<Option<String>>;
    fn function_arn(&self, function_name: &str, region: &str) -> ReconcileResult<Option<String>>;
    /// Rule state (`ENABLED`/`DISABLED`), or `None` when the rule is absent.
    fn event_rule_state(&self, rule_name: &str, region: &str) -> ReconcileResult<Option<String>>;
    fn event_source_mappings(
        &self,
        function_name: &str,
        region: &str,
    ) -> ReconcileResult<Vec<EventSourceMapping>>;
    fn create_event_source_mapping(
        &self,
        function_name: &str,
        queue_arn: &str,
        region: &str,
    ) -> ReconcileResult<MutationReceipt>;
    fn enable_event_source_mapping(&self, uuid: &str, region: &str) -> ReconcileResult<MutationReceipt>;
}
