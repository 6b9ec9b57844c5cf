//! Structured run artifacts.
//!
//! Every run ends with a `RunReport`, including single-stack runs, which are
//! reported as a one-element fan-out.
use crate::cloud::WiringReport;
use crate::desired::StackTarget;
use crate::drift::DriftReport;
use crate::dry_run::PlannedOperation;
use crate::error::{ErrorRecord, ReconcileError};
use crate::preflight::PreflightReport;
use crate::registry::RegistryOutcome;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Created,
    Updated,
    Unchanged,
    Failed,
    /// Not started because the run was cancelled.
    Skipped,
}

impl ReconcileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileStatus::Created => "created",
            ReconcileStatus::Updated => "updated",
            ReconcileStatus::Unchanged => "unchanged",
            ReconcileStatus::Failed => "failed",
            ReconcileStatus::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ReconcileStatus::Created | ReconcileStatus::Updated | ReconcileStatus::Unchanged
        )
    }
}

/// Outcome of one stack job. Finalized once and never modified.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub target: StackTarget,
    pub status: ReconcileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl ReconciliationResult {
    pub fn succeeded(
        target: StackTarget,
        status: ReconcileStatus,
        outputs: BTreeMap<String, String>,
    ) -> Self {
        ReconciliationResult {
            target,
            status,
            error: None,
            outputs,
        }
    }

    pub fn failed(target: StackTarget, err: &ReconcileError) -> Self {
        ReconciliationResult {
            target,
            status: ReconcileStatus::Failed,
            error: Some(ErrorRecord::from(err)),
            outputs: BTreeMap::new(),
        }
    }

    pub fn skipped(target: StackTarget) -> Self {
        ReconciliationResult {
            target,
            status: ReconcileStatus::Skipped,
            error: None,
            outputs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct StatusCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_set_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_set_status: Option<ReconcileStatus>,
    pub results: Vec<ReconciliationResult>,
}

impl FanoutReport {
    /// Results are ordered by (account, region) whatever order they finished in.
    pub fn new(
        stack_set_name: Option<String>,
        stack_set_status: Option<ReconcileStatus>,
        mut results: Vec<ReconciliationResult>,
    ) -> Self {
        results.sort_by(|a, b| a.target.cmp(&b.target));
        FanoutReport {
            stack_set_name,
            stack_set_status,
            results,
        }
    }

    pub fn single(result: ReconciliationResult) -> Self {
        FanoutReport::new(None, None, vec![result])
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|result| result.status.is_success())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for result in &self.results {
            match result.status {
                ReconcileStatus::Created => counts.created += 1,
                ReconcileStatus::Updated => counts.updated += 1,
                ReconcileStatus::Unchanged => counts.unchanged += 1,
                ReconcileStatus::Failed => counts.failed += 1,
                ReconcileStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Check,
    Apply,
    DryRun,
    Preflight,
    Drift,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// At least one target failed, or drift was found.
    Failed,
    /// Preflight found blocking issues, or `--apply` was not given.
    Blocked,
    /// A run-level error stopped the run before any target was attempted.
    Aborted,
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed | RunOutcome::Blocked => 1,
            RunOutcome::Aborted => 2,
            RunOutcome::Cancelled => 130,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    pub generated_at_epoch_ms: u128,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacks: Option<FanoutReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiring: Option<WiringReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned_operations: Vec<PlannedOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl RunReport {
    pub fn new(mode: RunMode, generated_at_epoch_ms: u128) -> Self {
        RunReport {
            mode,
            generated_at_epoch_ms,
            outcome: RunOutcome::Succeeded,
            registry: None,
            preflight: None,
            stacks: None,
            wiring: None,
            drift: None,
            planned_operations: Vec::new(),
            error: None,
        }
    }

    /// Record a run-level error. The outcome becomes `Aborted` unless a
    /// stricter outcome was already set.
    pub fn abort(&mut self, err: &ReconcileError) {
        self.error = Some(ErrorRecord::from(err));
        if self.outcome == RunOutcome::Succeeded {
            self.outcome = RunOutcome::Aborted;
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(report).context("serialize run report")?;
    fs::write(path, format!("{text}\n")).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
