//! Multi-account, multi-region deployment of the stack through a stack set.
//!
//! `apply` refuses to run without a `PreflightClearance` for the same input.
//! Each resolved (account, region) pair is an independent job on a bounded
//! worker pool. A failed job is recorded in its own slot and never stops a
//! sibling. Cancellation stops dispatch; jobs already running finish.
//!
//! A stack set accepts one operation at a time, so workers look up their
//! instances in parallel but take turns issuing and settling mutations.
use crate::cloud::{
    CloudApi, MutationReceipt, SettleSettings, SingleStackReconciler, StackLocator, StackPhase,
    StackRequest, StackSetDescription, StackSetSpec,
};
use crate::desired::{AccountSelector, DesiredState, FanoutTargets, StackParameters, StackTarget};
use crate::error::{ReconcileError, ReconcileResult};
use crate::preflight::PreflightClearance;
use crate::report::{FanoutReport, ReconcileStatus, ReconciliationResult};
use crate::retry::RetryPolicy;
use crate::util::elapsed_ms;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Run-level cancellation flag shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StackJob {
    target: StackTarget,
    organizational_unit: Option<String>,
}

impl StackJob {
    fn locator(&self, stack_set_name: &str) -> StackLocator {
        StackLocator::Instance {
            stack_set_name: stack_set_name.to_string(),
            target: self.target.clone(),
            organizational_unit: self.organizational_unit.clone(),
        }
    }
}

/// Run `work` over `jobs` on at most `workers` threads. Each job writes only
/// its own slot. Slots left `None` were never started because of `cancel`.
pub(crate) fn run_bounded<J, R, F>(jobs: &[J], workers: usize, cancel: &CancelToken, work: F) -> Vec<Option<R>>
where
    J: Sync,
    R: Send,
    F: Fn(&J) -> R + Sync,
{
    let slots: Vec<Mutex<Option<R>>> = jobs.iter().map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);
    let workers = workers.clamp(1, jobs.len().max(1));
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if cancel.is_cancelled() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(index) else {
                    break;
                };
                let result = work(job);
                *slots[index].lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
            });
        }
    });
    slots
        .into_iter()
        .map(|slot| slot.into_inner().unwrap_or_else(PoisonError::into_inner))
        .collect()
}

pub struct FanoutController<'a> {
    cloud: &'a dyn CloudApi,
    retry: RetryPolicy,
    settle: SettleSettings,
    cancel: CancelToken,
}

impl<'a> FanoutController<'a> {
    pub fn new(
        cloud: &'a dyn CloudApi,
        retry: RetryPolicy,
        settle: SettleSettings,
        cancel: CancelToken,
    ) -> Self {
        FanoutController {
            cloud,
            retry,
            settle,
            cancel,
        }
    }

    pub fn apply(
        &self,
        desired: &DesiredState,
        parameters: &StackParameters,
        clearance: Option<&PreflightClearance>,
    ) -> ReconcileResult<FanoutReport> {
        let fanout = desired
            .fanout_targets
            .as_ref()
            .ok_or_else(|| ReconcileError::Validation("no fanout section is configured".to_string()))?;
        let fingerprint = desired.stack_fingerprint(&fanout.targets());
        match clearance {
            None => {
                return Err(ReconcileError::Precondition(
                    "mutating fan-out requires a clean preflight report".to_string(),
                ))
            }
            Some(clearance) if clearance.fingerprint() != fingerprint => {
                return Err(ReconcileError::Precondition(
                    "preflight clearance was issued for a different configuration; run preflight again"
                        .to_string(),
                ))
            }
            Some(_) => {}
        }
        parameters.ensure_required()?;

        let jobs = self.resolve_jobs(fanout)?;
        let name = Some(fanout.stack_set_name.clone());
        if self.cancel.is_cancelled() {
            tracing::warn!(jobs = jobs.len(), "cancelled before dispatch");
            let skipped = jobs
                .into_iter()
                .map(|job| ReconciliationResult::skipped(job.target))
                .collect();
            return Ok(FanoutReport::new(name, None, skipped));
        }
        let stack_set_status = self.ensure_stack_set(desired, fanout, parameters)?;

        let started = Instant::now();
        let workers = fanout.max_concurrency.min(jobs.len()).max(1);
        tracing::info!(
            stack_set = %fanout.stack_set_name,
            jobs = jobs.len(),
            workers,
            "fan-out dispatch"
        );
        let operation_gate = Mutex::new(());
        let reconciler = SingleStackReconciler::new(self.cloud, self.retry, self.settle)
            .with_operation_gate(&operation_gate);
        let outcomes = run_bounded(&jobs, workers, &self.cancel, |job| {
            reconciler.reconcile(&StackRequest {
                locator: job.locator(&fanout.stack_set_name),
                template: &desired.template,
                template_digest: None,
                parameters,
            })
        });
        let results: Vec<ReconciliationResult> = jobs
            .into_iter()
            .zip(outcomes)
            .map(|(job, outcome)| outcome.unwrap_or_else(|| ReconciliationResult::skipped(job.target)))
            .collect();

        let report = FanoutReport::new(name, Some(stack_set_status), results);
        let counts = report.counts();
        tracing::info!(
            elapsed_ms = elapsed_ms(started),
            created = counts.created,
            updated = counts.updated,
            unchanged = counts.unchanged,
            failed = counts.failed,
            skipped = counts.skipped,
            "fan-out complete"
        );
        Ok(report)
    }

    /// Resolve selectors to concrete (account, region) jobs, collapsing
    /// duplicates. The first selector that yields a target keeps it.
    fn resolve_jobs(&self, fanout: &FanoutTargets) -> ReconcileResult<Vec<StackJob>> {
        let mut ou_accounts: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut jobs: BTreeMap<StackTarget, Option<String>> = BTreeMap::new();
        for target in fanout.targets() {
            match &target.account_selector {
                AccountSelector::Account(account) => {
                    jobs.entry(StackTarget::new(account.as_str(), target.region.as_str()))
                        .or_insert(None);
                }
                AccountSelector::OrganizationalUnit(ou) => {
                    let accounts = match ou_accounts.entry(ou.clone()) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => entry.insert(
                            self.retry
                                .run("list accounts for parent", None, || {
                                    self.cloud.accounts_for_organizational_unit(ou)
                                })
                                .map_err(|err| err.context(&format!("organizational unit {ou}")))?,
                        ),
                    };
                    for account in accounts.iter() {
                        jobs.entry(StackTarget::new(account.as_str(), target.region.as_str()))
                            .or_insert_with(|| Some(ou.clone()));
                    }
                }
            }
        }
        Ok(jobs
            .into_iter()
            .map(|(target, organizational_unit)| StackJob {
                target,
                organizational_unit,
            })
            .collect())
    }

    fn ensure_stack_set(
        &self,
        desired: &DesiredState,
        fanout: &FanoutTargets,
        parameters: &StackParameters,
    ) -> ReconcileResult<ReconcileStatus> {
        let spec = StackSetSpec {
            name: fanout.stack_set_name.clone(),
            template: desired.template.clone(),
            parameters: parameters.clone(),
            permission_model: fanout.permission_model,
            admin_role_arn: fanout.admin_role_arn.clone(),
            execution_role_name: fanout.execution_role_name.clone(),
        };
        let label = format!("stack set {}", spec.name);
        let existing = self
            .describe_stack_set(&spec.name)
            .map_err(|err| err.context(&label))?;
        let Some(live) = existing else {
            return self.create_stack_set(&spec).map_err(|err| err.context(&label));
        };
        if live.permission_model != spec.permission_model {
            return Err(ReconcileError::Conflict(format!(
                "{label} exists with permission model {}",
                live.permission_model.as_api_str()
            )));
        }
        // A template that cannot be compared is always sent.
        let template_changed = match (desired.template_digest.as_deref(), live.template_digest.as_deref()) {
            (Some(wanted), Some(deployed)) => wanted != deployed,
            _ => true,
        };
        if !template_changed {
            tracing::debug!(stack_set = %spec.name, "stack set template unchanged");
            return Ok(ReconcileStatus::Unchanged);
        }
        let receipt = self
            .retry
            .run("update stack set", None, || self.cloud.update_stack_set(&spec))
            .map_err(|err| err.context(&label))?;
        self.await_operation(&spec.name, &receipt)
            .map_err(|err| err.context(&label))?;
        tracing::info!(stack_set = %spec.name, "updated stack set template");
        Ok(ReconcileStatus::Updated)
    }

    fn describe_stack_set(&self, name: &str) -> ReconcileResult<Option<StackSetDescription>> {
        self.retry
            .run("describe stack set", None, || self.cloud.describe_stack_set(name))
    }

    /// Create the stack set. A create that committed before its response was
    /// lost comes back as a name conflict; the stack set is then read back.
    fn create_stack_set(&self, spec: &StackSetSpec) -> ReconcileResult<ReconcileStatus> {
        match self
            .retry
            .run("create stack set", None, || self.cloud.create_stack_set(spec))
        {
            Ok(_) => {}
            Err(ReconcileError::Conflict(message)) => {
                let created = self.describe_stack_set(&spec.name)?;
                match created {
                    Some(live) if live.permission_model == spec.permission_model => {
                        tracing::info!(stack_set = %spec.name, "stack set already created by an earlier attempt");
                    }
                    _ => return Err(ReconcileError::Conflict(message)),
                }
            }
            Err(err) => return Err(err),
        }
        tracing::info!(stack_set = %spec.name, "created stack set");
        Ok(ReconcileStatus::Created)
    }

    /// Poll a stack set operation until it finishes. Instance operations
    /// cannot start while it runs.
    fn await_operation(&self, name: &str, receipt: &MutationReceipt) -> ReconcileResult<()> {
        let Some(operation_id) = receipt.operation_id.as_deref().filter(|_| !receipt.simulated) else {
            return Ok(());
        };
        let deadline = Instant::now() + self.settle.target_timeout;
        loop {
            let phase = self.retry.run("describe stack set operation", Some(deadline), || {
                self.cloud.stack_set_operation_phase(name, operation_id)
            })?;
            match phase {
                StackPhase::Complete => return Ok(()),
                StackPhase::InProgress => {
                    if Instant::now() + self.settle.poll_interval >= deadline {
                        return Err(ReconcileError::Transient(format!(
                            "operation {operation_id} still running at the deadline"
                        )));
                    }
                    tracing::debug!(stack_set = name, operation = operation_id, "waiting for stack set operation");
                    std::thread::sleep(self.settle.poll_interval);
                }
                StackPhase::RolledBack | StackPhase::Failed => {
                    return Err(ReconcileError::Fatal(format!(
                        "operation {operation_id} did not succeed"
                    )));
                }
            }
        }
    }
}
