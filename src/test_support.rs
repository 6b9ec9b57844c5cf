//! In-memory registry and cloud fakes that count reads and mutating calls.
use crate::cloud::{
    CallerIdentity, CloudApi, EventSourceMapping, MutationReceipt, StackDescription, StackLocator,
    StackPhase, StackSetDescription, StackSetSpec, TemplateParameter, UpdateOutcome,
};
use crate::desired::{
    AccountSelector, DesiredState, FanoutTargets, ParameterValue, PermissionModel,
    RegistryDocuments, StackParameters, StackTarget, TemplateRef, WebhookSpec, REQUIRED_PARAMETERS,
};
use crate::error::{ReconcileError, ReconcileResult};
use crate::registry::RegistryApi;
use crate::util::sha256_hex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

pub const CALLER_ACCOUNT: &str = "111111111111";

pub fn sample_template() -> TemplateRef {
    TemplateRef::File(PathBuf::from("cloudformation/template.yaml"))
}

/// Stand-in for the digest of a template's body.
pub fn template_digest_of(template: &TemplateRef) -> String {
    sha256_hex(template.to_string().as_bytes())
}

pub fn sample_desired_state() -> DesiredState {
    DesiredState {
        registry_integration_id: "aws-serverless".to_string(),
        integration_type: "aws-serverless".to_string(),
        integration_version: "1.0.0".to_string(),
        webhook_spec: WebhookSpec::Identifier("aws_ingest".to_string()),
        documents: RegistryDocuments {
            schemas: vec![
                json!({
                    "identifier": "awsEvent",
                    "title": "AWS Event",
                    "schema": {"properties": {"event": {"type": "object"}}}
                }),
                json!({
                    "identifier": "ec2Instance",
                    "title": "EC2 Instance",
                    "schema": {"properties": {"state": {"type": "string"}}}
                }),
            ],
            mapping_config: json!({
                "resources": [{
                    "kind": "ec2_instance",
                    "selector": {"query": "true"},
                    "port": {"entity": {"mappings": {"identifier": ".id", "blueprint": "\"ec2Instance\""}}}
                }]
            }),
            webhook_mappings: None,
        },
        stack_name: "port-aws-serverless".to_string(),
        queue_name: "port-aws-events-queue".to_string(),
        function_name: "port-aws-event-processor".to_string(),
        event_sources: ["aws.ec2", "aws.s3"].iter().map(|s| s.to_string()).collect(),
        region_default: "us-east-1".to_string(),
        template: sample_template(),
        template_digest: Some(template_digest_of(&sample_template())),
        keep_previous: BTreeSet::new(),
        extra_parameters: BTreeMap::new(),
        fanout_targets: None,
    }
}

pub const STACK_SET_NAME: &str = "port-aws-serverless";

/// `sample_desired_state` with a fan-out section.
pub fn fanout_desired_state(
    permission_model: PermissionModel,
    selectors: &[AccountSelector],
    regions: &[&str],
) -> DesiredState {
    let mut desired = sample_desired_state();
    desired.fanout_targets = Some(FanoutTargets {
        stack_set_name: STACK_SET_NAME.to_string(),
        permission_model,
        admin_role_arn: (permission_model == PermissionModel::SelfManaged).then(|| {
            format!("arn:aws:iam::{CALLER_ACCOUNT}:role/AWSCloudFormationStackSetAdministrationRole")
        }),
        execution_role_name: "AWSCloudFormationStackSetExecutionRole".to_string(),
        account_selectors: selectors.to_vec(),
        regions: regions.iter().map(|region| region.to_string()).collect(),
        max_concurrency: 2,
    });
    desired
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("fake state lock")
}

#[derive(Debug, Default)]
pub struct FakeRegistryState {
    pub blueprints: BTreeMap<String, Value>,
    pub webhooks: BTreeMap<String, Value>,
    pub integrations: BTreeMap<String, Value>,
    pub reject_credentials: bool,
    /// Accept full integration patches without applying their config.
    pub drop_integration_patch_config: bool,
    /// Creates commit, then answer 409 the way a retried POST does after
    /// the first response was lost.
    pub conflict_after_create: bool,
}

pub struct FakeRegistry {
    ingest_base_url: String,
    state: Mutex<FakeRegistryState>,
    reads: AtomicUsize,
    mutations: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(ingest_base_url: &str) -> Self {
        FakeRegistry {
            ingest_base_url: ingest_base_url.trim_end_matches('/').to_string(),
            state: Mutex::new(FakeRegistryState::default()),
            reads: AtomicUsize::new(0),
            mutations: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeRegistryState> {
        lock(&self.state)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn webhook_count(&self) -> usize {
        self.state().webhooks.len()
    }

    fn read(&self) -> ReconcileResult<MutexGuard<'_, FakeRegistryState>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.reject_credentials {
            return Err(ReconcileError::Auth("HTTP 401: invalid token".to_string()));
        }
        Ok(state)
    }

    fn mutate(&self) -> ReconcileResult<MutexGuard<'_, FakeRegistryState>> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.reject_credentials {
            return Err(ReconcileError::Auth("HTTP 401: invalid token".to_string()));
        }
        Ok(state)
    }
}

fn identifier_of(document: &Value) -> ReconcileResult<String> {
    document
        .get("identifier")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ReconcileError::Validation("identifier missing".to_string()))
}

impl RegistryApi for FakeRegistry {
    fn get_blueprint(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        Ok(self.read()?.blueprints.get(identifier).cloned())
    }

    fn create_blueprint(&self, document: &Value) -> ReconcileResult<Value> {
        let identifier = identifier_of(document)?;
        let mut state = self.mutate()?;
        if state.blueprints.contains_key(&identifier) {
            return Err(ReconcileError::Conflict(format!("{identifier} exists")));
        }
        let mut stored = document.clone();
        stored["createdAt"] = json!("2026-01-01T00:00:00Z");
        state.blueprints.insert(identifier.clone(), stored.clone());
        if state.conflict_after_create {
            return Err(ReconcileError::Conflict(format!("HTTP 409: {identifier} exists")));
        }
        Ok(stored)
    }

    fn replace_blueprint(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        let mut state = self.mutate()?;
        if !state.blueprints.contains_key(identifier) {
            return Err(ReconcileError::Conflict(format!("{identifier} missing")));
        }
        state.blueprints.insert(identifier.to_string(), document.clone());
        Ok(document.clone())
    }

    fn get_webhook(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        Ok(self.read()?.webhooks.get(identifier).cloned())
    }

    fn create_webhook(&self, document: &Value) -> ReconcileResult<Value> {
        let identifier = identifier_of(document)?;
        let url = format!("{}/{identifier}", self.ingest_base_url);
        let mut state = self.mutate()?;
        if state.webhooks.contains_key(&identifier) {
            return Err(ReconcileError::Conflict(format!("{identifier} exists")));
        }
        let mut stored = document.clone();
        stored["url"] = json!(url);
        state.webhooks.insert(identifier.clone(), stored.clone());
        if state.conflict_after_create {
            return Err(ReconcileError::Conflict(format!("HTTP 409: {identifier} exists")));
        }
        Ok(stored)
    }

    fn update_webhook(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        let mut state = self.mutate()?;
        let live = state
            .webhooks
            .get_mut(identifier)
            .ok_or_else(|| ReconcileError::Conflict(format!("{identifier} missing")))?;
        if let (Some(live_map), Some(patch)) = (live.as_object_mut(), document.as_object()) {
            for (key, value) in patch {
                live_map.insert(key.clone(), value.clone());
            }
        }
        Ok(live.clone())
    }

    fn get_integration(&self, identifier: &str) -> ReconcileResult<Option<Value>> {
        Ok(self.read()?.integrations.get(identifier).cloned())
    }

    fn create_integration(&self, document: &Value) -> ReconcileResult<Value> {
        let identifier = document
            .get("installationId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::Validation("installationId missing".to_string()))?;
        let mut state = self.mutate()?;
        if state.integrations.contains_key(&identifier) {
            return Err(ReconcileError::Conflict(format!("{identifier} exists")));
        }
        let mut stored = document.clone();
        stored["createdAt"] = json!("2026-01-01T00:00:00Z");
        state.integrations.insert(identifier.clone(), stored.clone());
        if state.conflict_after_create {
            return Err(ReconcileError::Conflict(format!("HTTP 409: {identifier} exists")));
        }
        Ok(json!({"ok": true, "integration": stored}))
    }

    fn update_integration(&self, identifier: &str, document: &Value) -> ReconcileResult<Value> {
        let mut state = self.mutate()?;
        let drop_config = state.drop_integration_patch_config;
        let live = state
            .integrations
            .get_mut(identifier)
            .ok_or_else(|| ReconcileError::Conflict(format!("{identifier} missing")))?;
        let previous_config = live.get("config").cloned();
        let mut stored = document.clone();
        if drop_config {
            stored["config"] = previous_config.unwrap_or(Value::Null);
        }
        *live = stored.clone();
        Ok(stored)
    }

    fn update_integration_config(&self, identifier: &str, config: &Value) -> ReconcileResult<Value> {
        let mut state = self.mutate()?;
        let live = state
            .integrations
            .get_mut(identifier)
            .ok_or_else(|| ReconcileError::Conflict(format!("{identifier} missing")))?;
        live["config"] = config.clone();
        Ok(live.clone())
    }
}

#[derive(Debug, Clone)]
pub struct FakeStack {
    pub status: String,
    pub phase: StackPhase,
    /// For stack set instances, only the overrides.
    pub parameters: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub template_digest: Option<String>,
}

impl FakeStack {
    pub fn complete(parameters: BTreeMap<String, String>) -> Self {
        FakeStack {
            status: "CREATE_COMPLETE".to_string(),
            phase: StackPhase::Complete,
            parameters,
            outputs: BTreeMap::from([("QueueUrl".to_string(), "https://sqs.example/q".to_string())]),
            template_digest: Some(template_digest_of(&sample_template())),
        }
    }
}

#[derive(Debug)]
pub struct FakeCloudState {
    /// Keyed by (stack or stack-set name, target).
    pub stacks: BTreeMap<(String, StackTarget), FakeStack>,
    /// Accounts whose stack mutations are denied.
    pub denied_accounts: BTreeSet<String>,
    /// Read operations answered with AccessDenied, by API name.
    pub denied_reads: BTreeSet<String>,
    /// Reject a second mutation on a stack set while one is running.
    pub one_operation_per_stack_set: bool,
    /// Stack set name to the instance whose operation is running.
    pub running_operations: BTreeMap<String, StackTarget>,
    /// Stack set operations polled through `stack_set_operation_phase`.
    pub operation_polls: usize,
    /// The next stack set create commits but its response is lost.
    pub lose_stack_set_create_response: bool,
    /// Remaining describe calls that fail with a transient error.
    pub transient_describe_failures: usize,
    /// Settle polls a freshly mutated stack reports in progress before completing.
    pub settle_polls: usize,
    /// Create leaves the stack in this failed status instead of completing.
    pub create_failure: Option<(String, String)>,
    pub caller: CallerIdentity,
    pub management_account: Option<String>,
    pub delegated_admins: BTreeSet<String>,
    pub trusted_access: bool,
    pub roles: BTreeSet<String>,
    pub stack_sets: BTreeMap<String, StackSetDescription>,
    pub template_parameters: Vec<TemplateParameter>,
    pub template_error: Option<String>,
    pub regions: BTreeSet<String>,
    pub organizational_units: BTreeMap<String, Vec<String>>,
    pub inactive_accounts: BTreeSet<String>,
    pub queues: BTreeMap<String, String>,
    pub functions: BTreeMap<String, String>,
    pub rules: BTreeMap<String, String>,
    pub mappings: Vec<EventSourceMapping>,
    pending_polls: BTreeMap<(String, StackTarget), usize>,
}

impl Default for FakeCloudState {
    fn default() -> Self {
        FakeCloudState {
            stacks: BTreeMap::new(),
            denied_accounts: BTreeSet::new(),
            denied_reads: BTreeSet::new(),
            one_operation_per_stack_set: false,
            running_operations: BTreeMap::new(),
            operation_polls: 0,
            lose_stack_set_create_response: false,
            transient_describe_failures: 0,
            settle_polls: 0,
            create_failure: None,
            caller: CallerIdentity {
                account_id: CALLER_ACCOUNT.to_string(),
                arn: format!("arn:aws:iam::{CALLER_ACCOUNT}:user/operator"),
            },
            management_account: Some(CALLER_ACCOUNT.to_string()),
            delegated_admins: BTreeSet::new(),
            trusted_access: true,
            roles: BTreeSet::new(),
            stack_sets: BTreeMap::new(),
            template_parameters: REQUIRED_PARAMETERS
                .iter()
                .map(|key| TemplateParameter {
                    key: key.to_string(),
                    has_default: true,
                })
                .collect(),
            template_error: None,
            regions: ["us-east-1", "us-west-2", "eu-west-1"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            organizational_units: BTreeMap::new(),
            inactive_accounts: BTreeSet::new(),
            queues: BTreeMap::new(),
            functions: BTreeMap::new(),
            rules: BTreeMap::new(),
            mappings: Vec::new(),
            pending_polls: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeCloudState>,
    reads: AtomicUsize,
    mutations: AtomicUsize,
}

fn stack_key(locator: &StackLocator) -> (String, StackTarget) {
    (locator.name().to_string(), locator.target().clone())
}

impl FakeCloud {
    pub fn new() -> Self {
        FakeCloud::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeCloudState> {
        lock(&self.state)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn stack(&self, name: &str, target: &StackTarget) -> Option<FakeStack> {
        self.state()
            .stacks
            .get(&(name.to_string(), target.clone()))
            .cloned()
    }

    pub fn insert_stack(&self, name: &str, target: &StackTarget, stack: FakeStack) {
        self.state()
            .stacks
            .insert((name.to_string(), target.clone()), stack);
    }

    fn read(&self) -> MutexGuard<'_, FakeCloudState> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.state()
    }

    fn read_as(&self, operation: &str) -> ReconcileResult<MutexGuard<'_, FakeCloudState>> {
        let state = self.read();
        if state.denied_reads.contains(operation) {
            return Err(ReconcileError::Permission(format!(
                "{operation} (AccessDenied): not authorized"
            )));
        }
        Ok(state)
    }

    fn mutate(&self, locator: Option<&StackLocator>) -> ReconcileResult<MutexGuard<'_, FakeCloudState>> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if let Some(locator) = locator {
            if state.denied_accounts.contains(&locator.target().account_id) {
                return Err(ReconcileError::Permission(format!(
                    "AccessDenied: not authorized to mutate {locator}"
                )));
            }
        }
        Ok(state)
    }
}

/// Effective parameters: an instance inherits the stack set values it does
/// not override.
fn effective_parameters(state: &FakeCloudState, locator: &StackLocator, own: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let StackLocator::Instance { stack_set_name, .. } = locator else {
        return own.clone();
    };
    let mut merged = state
        .stack_sets
        .get(stack_set_name)
        .map(|stack_set| stack_set.parameters.clone())
        .unwrap_or_default();
    merged.extend(own.iter().map(|(key, value)| (key.clone(), value.clone())));
    merged
}

/// Start an operation on the locator's stack set, or refuse while another runs.
fn begin_operation(state: &mut FakeCloudState, locator: &StackLocator) -> ReconcileResult<()> {
    let StackLocator::Instance { stack_set_name, target, .. } = locator else {
        return Ok(());
    };
    if !state.one_operation_per_stack_set {
        return Ok(());
    }
    if state.running_operations.contains_key(stack_set_name) {
        return Err(ReconcileError::Conflict(format!(
            "OperationInProgressException: another operation on stack set {stack_set_name} is in progress"
        )));
    }
    state
        .running_operations
        .insert(stack_set_name.clone(), target.clone());
    Ok(())
}

fn apply_parameters(
    live: &BTreeMap<String, String>,
    parameters: &StackParameters,
) -> ReconcileResult<BTreeMap<String, String>> {
    let mut next = BTreeMap::new();
    for (key, value) in parameters.iter() {
        let resolved = match value {
            ParameterValue::Explicit(value) => value.clone(),
            ParameterValue::KeepPrevious => live.get(key).cloned().ok_or_else(|| {
                ReconcileError::Validation(format!("no previous value for {key}"))
            })?,
        };
        next.insert(key.clone(), resolved);
    }
    Ok(next)
}

impl CloudApi for FakeCloud {
    fn describe_stack(&self, locator: &StackLocator) -> ReconcileResult<Option<StackDescription>> {
        let mut state = self.read_as("DescribeStacks")?;
        if state.transient_describe_failures > 0 {
            state.transient_describe_failures -= 1;
            return Err(ReconcileError::Transient("Throttling: rate exceeded".to_string()));
        }
        let key = stack_key(locator);
        let pending = state.pending_polls.get(&key).copied().unwrap_or(0);
        let is_instance = matches!(locator, StackLocator::Instance { .. });
        let Some(stack) = state.stacks.get(&key).cloned() else {
            return Ok(None);
        };
        let parameters = effective_parameters(&state, locator, &stack.parameters);
        let template_digest = if is_instance { None } else { stack.template_digest.clone() };
        if pending > 0 {
            state.pending_polls.insert(key, pending - 1);
            return Ok(Some(StackDescription {
                status: "UPDATE_IN_PROGRESS".to_string(),
                phase: StackPhase::InProgress,
                parameters,
                outputs: BTreeMap::new(),
                template_digest,
            }));
        }
        if state.running_operations.get(locator.name()) == Some(locator.target()) {
            state.running_operations.remove(locator.name());
        }
        Ok(Some(StackDescription {
            status: stack.status,
            phase: stack.phase,
            parameters,
            outputs: stack.outputs,
            template_digest,
        }))
    }

    fn create_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<MutationReceipt> {
        let mut state = self.mutate(Some(locator))?;
        let key = stack_key(locator);
        if state.stacks.contains_key(&key) {
            return Err(ReconcileError::Conflict(format!("{locator} already exists")));
        }
        let values = apply_parameters(&BTreeMap::new(), parameters)?;
        begin_operation(&mut state, locator)?;
        let mut stack = FakeStack::complete(values);
        stack.template_digest = Some(template_digest_of(template));
        if let Some((status, _)) = &state.create_failure {
            stack.status = status.clone();
            stack.phase = StackPhase::Failed;
        }
        let polls = state.settle_polls;
        state.pending_polls.insert(key.clone(), polls);
        state.stacks.insert(key, stack);
        Ok(MutationReceipt::sent(Some(format!("op-create-{locator}"))))
    }

    fn update_stack(
        &self,
        locator: &StackLocator,
        template: &TemplateRef,
        parameters: &StackParameters,
    ) -> ReconcileResult<UpdateOutcome> {
        let mut state = self.mutate(Some(locator))?;
        let key = stack_key(locator);
        let polls = state.settle_polls;
        let live = state
            .stacks
            .get(&key)
            .cloned()
            .ok_or_else(|| ReconcileError::Validation(format!("{locator} does not exist")))?;
        let current = effective_parameters(&state, locator, &live.parameters);
        let next = apply_parameters(&current, parameters)?;
        let digest = match locator {
            StackLocator::Instance { .. } => live.template_digest.clone(),
            StackLocator::Stack { .. } => Some(template_digest_of(template)),
        };
        if next == current && digest == live.template_digest {
            return Ok(UpdateOutcome::NoChanges);
        }
        begin_operation(&mut state, locator)?;
        if let Some(stack) = state.stacks.get_mut(&key) {
            stack.parameters = next;
            stack.template_digest = digest;
            stack.status = "UPDATE_COMPLETE".to_string();
            stack.phase = StackPhase::Complete;
        }
        state.pending_polls.insert(key, polls);
        Ok(UpdateOutcome::Started(MutationReceipt::sent(Some(format!(
            "op-update-{locator}"
        )))))
    }

    fn stack_failure_reason(&self, _locator: &StackLocator) -> ReconcileResult<Option<String>> {
        Ok(self.read().create_failure.as_ref().map(|(_, reason)| reason.clone()))
    }

    fn caller_identity(&self) -> ReconcileResult<CallerIdentity> {
        Ok(self.read().caller.clone())
    }

    fn management_account_id(&self) -> ReconcileResult<Option<String>> {
        Ok(self.read().management_account.clone())
    }

    fn is_delegated_stack_set_admin(&self, account_id: &str) -> ReconcileResult<bool> {
        Ok(self
            .read_as("ListDelegatedAdministrators")?
            .delegated_admins
            .contains(account_id))
    }

    fn stack_set_trusted_access_enabled(&self) -> ReconcileResult<bool> {
        Ok(self.read_as("ListAWSServiceAccessForOrganization")?.trusted_access)
    }

    fn role_exists(&self, role_arn: &str) -> ReconcileResult<bool> {
        Ok(self.read_as("GetRole")?.roles.contains(role_arn))
    }

    fn list_stack_sets(&self) -> ReconcileResult<Vec<String>> {
        Ok(self.read_as("ListStackSets")?.stack_sets.keys().cloned().collect())
    }

    fn describe_stack_set(&self, name: &str) -> ReconcileResult<Option<StackSetDescription>> {
        Ok(self.read_as("DescribeStackSet")?.stack_sets.get(name).cloned())
    }

    fn validate_template(&self, _template: &TemplateRef) -> ReconcileResult<Vec<TemplateParameter>> {
        let state = self.read();
        if let Some(message) = &state.template_error {
            return Err(ReconcileError::Validation(message.clone()));
        }
        Ok(state.template_parameters.clone())
    }

    fn enabled_regions(&self) -> ReconcileResult<BTreeSet<String>> {
        Ok(self.read_as("DescribeRegions")?.regions.clone())
    }

    fn accounts_for_organizational_unit(&self, ou_id: &str) -> ReconcileResult<Vec<String>> {
        self.read()
            .organizational_units
            .get(ou_id)
            .cloned()
            .ok_or_else(|| ReconcileError::Validation(format!("organizational unit {ou_id} not found")))
    }

    fn account_is_active(&self, account_id: &str) -> ReconcileResult<bool> {
        Ok(!self
            .read_as("DescribeAccount")?
            .inactive_accounts
            .contains(account_id))
    }

    fn create_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt> {
        let mut state = self.mutate(None)?;
        if state.stack_sets.contains_key(&spec.name) {
            return Err(ReconcileError::Conflict(format!(
                "NameAlreadyExistsException: stack set {} exists",
                spec.name
            )));
        }
        // Kept parameters are left out on create; the template default applies.
        let mut parameters: BTreeMap<String, String> = state
            .template_parameters
            .iter()
            .filter(|param| param.has_default)
            .map(|param| (param.key.clone(), format!("{}-default", param.key)))
            .collect();
        parameters.extend(spec.parameters.without_keep_previous().explicit_values());
        state.stack_sets.insert(
            spec.name.clone(),
            StackSetDescription {
                permission_model: spec.permission_model,
                template_digest: Some(template_digest_of(&spec.template)),
                parameters,
            },
        );
        if std::mem::take(&mut state.lose_stack_set_create_response) {
            return Err(ReconcileError::Transient("connection reset by peer".to_string()));
        }
        Ok(MutationReceipt::sent(None))
    }

    fn update_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<MutationReceipt> {
        let mut state = self.mutate(None)?;
        let stack_set = state
            .stack_sets
            .get_mut(&spec.name)
            .ok_or_else(|| ReconcileError::Validation(format!("stack set {} not found", spec.name)))?;
        let next = apply_parameters(&stack_set.parameters, &spec.parameters)?;
        stack_set.parameters.extend(next);
        stack_set.template_digest = Some(template_digest_of(&spec.template));
        Ok(MutationReceipt::sent(Some(format!("op-update-{}", spec.name))))
    }

    fn stack_set_operation_phase(
        &self,
        _stack_set_name: &str,
        _operation_id: &str,
    ) -> ReconcileResult<StackPhase> {
        self.read().operation_polls += 1;
        Ok(StackPhase::Complete)
    }

    fn queue_arn(&self, queue_name: &str, _region: &str) -> ReconcileResult<Option<String>> {
        Ok(self.read().queues.get(queue_name).cloned())
    }

    fn function_arn(&self, function_name: &str, _region: &str) -> ReconcileResult<Option<String>> {
        Ok(self.read().functions.get(function_name).cloned())
    }

    fn event_rule_state(&self, rule_name: &str, _region: &str) -> ReconcileResult<Option<String>> {
        Ok(self.read().rules.get(rule_name).cloned())
    }

    fn event_source_mappings(
        &self,
        _function_name: &str,
        _region: &str,
    ) -> ReconcileResult<Vec<EventSourceMapping>> {
        Ok(self.read().mappings.clone())
    }

    fn create_event_source_mapping(
        &self,
        _function_name: &str,
        queue_arn: &str,
        _region: &str,
    ) -> ReconcileResult<MutationReceipt> {
        let mut state = self.mutate(None)?;
        let uuid = format!("mapping-{}", state.mappings.len() + 1);
        state.mappings.push(EventSourceMapping {
            uuid,
            source_arn: queue_arn.to_string(),
            enabled: true,
        });
        Ok(MutationReceipt::sent(None))
    }

    fn enable_event_source_mapping(&self, uuid: &str, _region: &str) -> ReconcileResult<MutationReceipt> {
        let mut state = self.mutate(None)?;
        for mapping in state.mappings.iter_mut().filter(|m| m.uuid == uuid) {
            mapping.enabled = true;
        }
        Ok(MutationReceipt::sent(None))
    }
}
