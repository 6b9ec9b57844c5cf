//! Dry-run decorators over both control planes.
//!
//! Reads pass through to the live adapter so create-versus-update decisions
//! come from real lookups. Every mutating call is recorded in a shared
//! `PlanLog` and answered with a simulated response instead of being sent.
use crate::cloud::{
    CallerIdentity, CloudApi, EventSourceMapping, MutationReceipt, StackDescription, StackLocator,
    StackPhase, StackSetDescription, StackSetSpec, TemplateParameter, UpdateOutcome,
};
use crate::desired::{StackParameters, TemplateRef};
use crate::error::ReconcileResult;
use crate::registry::RegistryApi;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlPlane {
    Registry,
    Cloud,
}

/// One mutating call that a live run would have made.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PlannedOperation {
    pub plane: ControlPlane,
    pub operation: String,
    pub resource: String,
    pub detail: Value,
}

#[derive(Debug, Default)]
pub struct PlanLog {
    entries: Mutex<Vec<PlannedOperation>>,
}

impl PlanLog {
    pub fn new() -> Self {
        PlanLog::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PlannedOperation>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, plane: ControlPlane, operation: &str, resource: &str, detail: Value) {
        tracing::info!(plane = ?plane, operation, resource, "dry run: would call");
        self.lock().push(PlannedOperation {
            plane,
            operation: operation.to_string(),
            resource: resource.to_string(),
            detail,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Entries in a stable order, independent of worker completion order.
    pub fn take_sorted(&self) -> Vec<PlannedOperation> {
        let mut entries = std::mem::take(&mut *self.lock());
        entries.sort_by(|a, b| {
            (a.plane as u8, &a.resource, &a.operation).cmp(&(b.plane as u8, &b.resource, &b.operation))
        });
        entries
    }
}

pub struct DryRunRegistry<'a> {
    inner: &'a dyn RegistryApi,
    ingest_base_url: String,
    log: &'a PlanLog,
}

impl<'a> DryRunRegistry<'a> {
    pub fn new(inner: &'a dyn RegistryApi, ingest_base_url: &str, log: &'a PlanLog) -> Self {
        DryRunRegistry {
            inner,
            ingest_base_url: ingest_base_url.trim_end_matches('/').to_string(),
            log,
        }
    }

    fn record(&self, operation: &str, resource: &str, detail: &Value) {
        self.log
            .record(ControlPlane::Registry, operation, resource, detail.clone());
    }
}

fn identifier_or(document: &Value, field: &str) -> String {
    document
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string()
}

impl RegistryApi for DryRunRegistry<'_> {
    fn get_blueprint(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        self.inner.get_blueprint(identifier)
    }

    fn create_blueprint(&self, document: &Value) -> ReconcileResult<Value> {
        self.record("create_schema", &identifier_or(document, "identifier"), document);
        Ok(document.clone())
    }

    fn replace_blueprint(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        self.record("replace_schema", identifier, document);
        Ok(document.clone())
    }

    fn get_webhook(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        self.inner.get_webhook(identifier)
    }

    fn create_webhook(&self, document: &Value) -> ReconcileResult<Value> {
        let identifier = identifier_or(document, "identifier");
        self.record("create_webhook", &identifier, document);
        let mut simulated = document.clone();
        simulated["url"] = Value::String(format!("{}/{identifier}", self.ingest_base_url));
        Ok(simulated)
    }

    fn update_webhook(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        self.record("update_webhook", identifier, document);
        Ok(document.clone())
    }

    fn get_integration(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        self.inner.get_integration(identifier)
    }

    fn create_integration(&self, document: &Value) -> ReconcileResult<Value> {
        self.record("create_integration", &identifier_or(document, "installationId"), document);
        Ok(document.clone())
    }

    fn update_integration(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        self.record("update_integration", identifier, document);
        Ok(document.clone())
    }

    fn update_integration_config(&self, identifier: &str, config: &Value) -> ReconcileResult<Value> {
        self.record("update_integration_config", identifier, config);
        let mut simulated = Map::new();
        simulated.insert("config".to_string(), config.clone());
        Ok(Value::Object(simulated))
    }
}

pub struct DryRunCloud<'a> {
    inner: &'a dyn CloudApi,
    log: &'a PlanLog,
}

impl<'a> DryRunCloud<'a> {
    pub fn new(inner: &'a dyn CloudApi, log: &'a PlanLog) -> Self {
        DryRunCloud { inner, log }
    }

    fn record(&self, operation: &str, resource: &str, detail: Value) -> MutationReceipt {
        self.log.record(ControlPlane::Cloud, operation, resource, detail);
        MutationReceipt::simulated()
    }
}

fn stack_detail(template: &TemplateRef, parameters: &StackParameters) -> Value {
    json!({
        "template": template.to_string(),
        "parameters": parameters,
    })
}

impl CloudApi for DryRunCloud<'_> {
    fn describe_stack(&self, locator: &StackLocator) -> ReconcileResult<Option<StackDescription>> {
        self.inner.describe_stack(locator)
    }

    fn create_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<MutationReceipt> {
        let operation = match locator {
            StackLocator::Stack { .. } => "create_stack",
            StackLocator::Instance { .. } => "create_stack_instance",
        };
        Ok(self.record(operation, &locator.to_string(), stack_detail(template, parameters)))
    }

    fn update_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<UpdateOutcome> {
        let operation = match locator {
            StackLocator::Stack { .. } => "update_stack",
            StackLocator::Instance { .. } => "update_stack_instance",
        };
        Ok(UpdateOutcome::Started(self.record(
            operation,
            &locator.to_string(),
            stack_detail(template, parameters),
        )))
    }

    fn stack_failure_reason(&self, locator: &StackLocator) -> ReconcileResult<Option<String>> {
        self.inner.stack_failure_reason(locator)
    }

    fn caller_identity(&self) -> ReconcileResult<CallerIdentity> {
        self.inner.caller_identity()
    }

    fn management_account_id(&self) -> ReconcileResult<Option<String>> {
        self.inner.management_account_id()
    }

    fn is_delegated_stack_set_admin(&self, account_id: &str) -> ReconcileResult<bool> {
        self.inner.is_delegated_stack_set_admin(account_id)
    }

    fn stack_set_trusted_access_enabled(&self) -> ReconcileResult<bool> {
        self.inner.stack_set_trusted_access_enabled()
    }

    fn role_exists(&self, role_arn: &str) -> ReconcileResult<bool> {
        self.inner.role_exists(role_arn)
    }

    fn list_stack_sets(&self) -> ReconcileResult<Vec<String>> {
        self.inner.list_stack_sets()
    }

    fn describe_stack_set(&self, name: &str) -> ReconcileResult<Option<StackSetDescription>> {
        self.inner.describe_stack_set(name)
    }

    fn validate_template(&self, template: &TemplateRef) -> ReconcileResult<Vec<TemplateParameter>> {
        self.inner.validate_template(template)
    }

    fn enabled_regions(&self) -> ReconcileResult<BTreeSet<String>> {
        self.inner.enabled_regions()
    }

    fn accounts_for_organizational_unit(&self, ou_id: &str) -> ReconcileResult<Vec<String>> {
        self.inner.accounts_for_organizational_unit(ou_id)
    }

    fn account_is_active(&self, account_id: &str) -> ReconcileResult<bool> {
        self.inner.account_is_active(account_id)
    }

    fn create_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt> {
        Ok(self.record(
            "create_stack_set",
            &spec.name,
            json!({
                "template": spec.template.to_string(),
                "parameters": spec.parameters,
                "permission_model": spec.permission_model,
            }),
        ))
    }

    fn update_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt> {
        Ok(self.record(
            "update_stack_set",
            &spec.name,
            stack_detail(&spec.template, &spec.parameters),
        ))
    }

    fn stack_set_operation_phase(
        &self,
        stack_set_name: &str,
        operation_id: &str,
    ) -> ReconcileResult<StackPhase> {
        self.inner.stack_set_operation_phase(stack_set_name, operation_id)
    }

    fn queue_arn(&self, queue_name: &str, region: &str) -> ReconcileResult<Option<String>> {
        self.inner.queue_arn(queue_name, region)
    }

    fn function_arn(&self, function_name: &str, region: &str) -> ReconcileResult<Option<String>> {
        self.inner.function_arn(function_name, region)
    }

    fn event_rule_state(&self, rule_name: &str, region: &str) -> ReconcileResult<Option<String>> {
        self.inner.event_rule_state(rule_name, region)
    }

    fn event_source_mappings(
        &self,
        function_name: &str,
        region: &str,
    ) -> ReconcileResult<Vec<EventSourceMapping>> {
        self.inner.event_source_mappings(function_name, region)
    }

    fn create_event_source_mapping(
        &self,
        function_name: &str,
        queue_arn: &str,
        region: &str,
    ) -> ReconcileResult<MutationReceipt> {
        Ok(self.record(
            "create_event_source_mapping",
            function_name,
            json!({"queue_arn": queue_arn, "region": region}),
        ))
    }

    fn enable_event_source_mapping(&self, uuid: &str, region: &str) -> ReconcileResult<MutationReceipt> {
        Ok(self.record(
            "enable_event_source_mapping",
            uuid,
            json!({"region": region}),
        ))
    }
}
