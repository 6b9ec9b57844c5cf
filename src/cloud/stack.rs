//! Create-or-update of one stack in one account/region.
//!
//! Within a target the order is strict: lookup, then create or update, then
//! poll until the stack leaves its in-progress phase. Every failure is
//! captured into the returned result; nothing here panics or aborts siblings.
use super::{CloudApi, StackDescription, StackLocator, StackPhase, UpdateOutcome};
use crate::desired::{StackParameters, TemplateRef};
use crate::error::{ReconcileError, ReconcileResult};
use crate::report::{ReconcileStatus, ReconciliationResult};
use crate::retry::RetryPolicy;
use crate::util::elapsed_ms;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_TARGET_TIMEOUT_SECS: u64 = 30 * 60;

/// Markers in a failure reason that point at a missing grant.
const PERMISSION_MARKERS: [&str; 3] = ["not authorized", "AccessDenied", "UnauthorizedOperation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleSettings {
    pub poll_interval: Duration,
    /// Upper bound for one target, retries and polling included.
    pub target_timeout: Duration,
}

impl Default for SettleSettings {
    fn default() -> Self {
        SettleSettings {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            target_timeout: Duration::from_secs(DEFAULT_TARGET_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackRequest<'a> {
    pub locator: StackLocator,
    pub template: &'a TemplateRef,
    pub template_digest: Option<&'a str>,
    pub parameters: &'a StackParameters,
}

pub struct SingleStackReconciler<'a> {
    cloud: &'a dyn CloudApi,
    retry: RetryPolicy,
    settle: SettleSettings,
    operation_gate: Option<&'a Mutex<()>>,
}

impl<'a> SingleStackReconciler<'a> {
    pub fn new(cloud: &'a dyn CloudApi, retry: RetryPolicy, settle: SettleSettings) -> Self {
        SingleStackReconciler {
            cloud,
            retry,
            settle,
            operation_gate: None,
        }
    }

    /// Hold `gate` from the mutating call until the target settles. Stack set
    /// instances share one gate because a stack set runs one operation at a time.
    pub fn with_operation_gate(mut self, gate: &'a Mutex<()>) -> Self {
        self.operation_gate = Some(gate);
        self
    }

    /// Wait for the operation gate. Time spent queued extends `deadline`.
    fn take_turn(&self, deadline: Instant) -> (Option<MutexGuard<'a, ()>>, Instant) {
        let Some(gate) = self.operation_gate else {
            return (None, deadline);
        };
        let queued = Instant::now();
        let turn = gate.lock().unwrap_or_else(PoisonError::into_inner);
        (Some(turn), deadline + queued.elapsed())
    }

    pub fn reconcile(&self, request: &StackRequest<'_>) -> ReconciliationResult {
        let target = request.locator.target().clone();
        let started = Instant::now();
        let deadline = started + self.settle.target_timeout;
        match self.reconcile_inner(request, deadline) {
            Ok((status, outputs)) => {
                tracing::info!(
                    elapsed_ms = elapsed_ms(started),
                    target = %target,
                    status = status.as_str(),
                    "stack reconcile complete"
                );
                ReconciliationResult::succeeded(target, status, outputs)
            }
            Err(err) => {
                tracing::warn!(
                    elapsed_ms = elapsed_ms(started),
                    target = %target,
                    error = %err,
                    "stack reconcile failed"
                );
                ReconciliationResult::failed(target, &err)
            }
        }
    }

    fn reconcile_inner(
        &self,
        request: &StackRequest<'_>,
        deadline: Instant,
    ) -> ReconcileResult<(ReconcileStatus, BTreeMap<String, String>)> {
        let locator = &request.locator;
        request.parameters.ensure_required()?;

        let live = self.retry.run(&format!("describe {locator}"), Some(deadline), || {
            self.cloud.describe_stack(locator)
        })?;

        let Some(live) = live else {
            let parameters = request.parameters.without_keep_previous();
            let (_turn, deadline) = self.take_turn(deadline);
            let receipt = self.retry.run(&format!("create {locator}"), Some(deadline), || {
                self.cloud.create_stack(locator, request.template, &parameters)
            })?;
            tracing::info!(target = %locator.target(), operation = ?receipt.operation_id, "create issued");
            if receipt.simulated {
                return Ok((ReconcileStatus::Created, BTreeMap::new()));
            }
            let settled = self.settle(locator, deadline)?;
            return Ok((ReconcileStatus::Created, settled.outputs));
        };

        match live.phase {
            StackPhase::InProgress => {
                return Err(ReconcileError::Conflict(format!(
                    "{locator} has an operation in flight ({})",
                    live.status
                )));
            }
            StackPhase::Failed => {
                return Err(ReconcileError::Conflict(format!(
                    "{locator} is in {} and needs operator cleanup before it can be updated",
                    live.status
                )));
            }
            StackPhase::Complete | StackPhase::RolledBack => {}
        }

        for key in request.parameters.keep_previous_keys() {
            if !live.parameters.contains_key(key) {
                return Err(ReconcileError::Validation(format!(
                    "{locator} has no live value for kept parameter {key}"
                )));
            }
        }

        if !needs_update(request, &live) {
            return Ok((ReconcileStatus::Unchanged, live.outputs));
        }

        let (_turn, deadline) = self.take_turn(deadline);
        let outcome = self.retry.run(&format!("update {locator}"), Some(deadline), || {
            self.cloud
                .update_stack(locator, request.template, request.parameters)
        })?;
        match outcome {
            UpdateOutcome::NoChanges => Ok((ReconcileStatus::Unchanged, live.outputs)),
            UpdateOutcome::Started(receipt) if receipt.simulated => {
                Ok((ReconcileStatus::Updated, live.outputs))
            }
            UpdateOutcome::Started(receipt) => {
                tracing::info!(target = %locator.target(), operation = ?receipt.operation_id, "update issued");
                let settled = self.settle(locator, deadline)?;
                Ok((ReconcileStatus::Updated, settled.outputs))
            }
        }
    }

    /// Poll until the stack leaves its in-progress phase or `deadline` passes.
    fn settle(&self, locator: &StackLocator, deadline: Instant) -> ReconcileResult<StackDescription> {
        let label = format!("describe {locator}");
        loop {
            let description = self
                .retry
                .run(&label, Some(deadline), || self.cloud.describe_stack(locator))?
                .ok_or_else(|| {
                    ReconcileError::Fatal(format!("{locator} disappeared while settling"))
                })?;
            match description.phase {
                StackPhase::Complete => return Ok(description),
                StackPhase::InProgress => {
                    if Instant::now() + self.settle.poll_interval >= deadline {
                        return Err(ReconcileError::Transient(format!(
                            "{locator} still {} at the per-target deadline",
                            description.status
                        )));
                    }
                    tracing::debug!(target = %locator.target(), status = %description.status, "waiting for stack to settle");
                    std::thread::sleep(self.settle.poll_interval);
                }
                StackPhase::RolledBack | StackPhase::Failed => {
                    let reason = match self.cloud.stack_failure_reason(locator) {
                        Ok(reason) => reason,
                        Err(err) => {
                            tracing::warn!(target = %locator.target(), error = %err, "could not read stack events");
                            None
                        }
                    };
                    return Err(settle_failure(locator, &description.status, reason));
                }
            }
        }
    }
}

fn needs_update(request: &StackRequest<'_>, live: &StackDescription) -> bool {
    let params_differ = request
        .parameters
        .explicit_values()
        .iter()
        .any(|(key, value)| live.parameters.get(key) != Some(value));
    // Instances follow the stack set template. A template that cannot be
    // compared is always sent; the provider reports when nothing changed.
    let template_differs = match (&request.locator, request.template_digest, live.template_digest.as_deref()) {
        (StackLocator::Instance { .. }, _, _) => false,
        (_, Some(desired), Some(current)) => desired != current,
        _ => true,
    };
    params_differ || template_differs
}

fn settle_failure(locator: &StackLocator, status: &str, reason: Option<String>) -> ReconcileError {
    let reason = reason.unwrap_or_else(|| "no failure reason recorded".to_string());
    let message = format!("{locator} ended in {status}: {reason}");
    if PERMISSION_MARKERS.iter().any(|marker| reason.contains(marker)) {
        ReconcileError::Permission(message)
    } else {
        ReconcileError::Fatal(message)
    }
}

#[cfg(test)]
#[path = "stack_tests.rs"]
mod tests;
