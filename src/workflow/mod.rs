//! Workflow orchestration, one entry point per CLI command.
//!
//! Every command except `send-event` ends in a `RunReport` printed to stdout
//! and, with `--out`, written to disk. The returned value is the exit code.
mod check;
mod drift;
mod preflight;
mod reconcile;
mod send_event;
mod settings;

pub use check::run_check;
pub use drift::run_drift;
pub use preflight::run_preflight;
pub use reconcile::run_reconcile;
pub use send_event::run_send_event;

use crate::config;
use crate::desired::DesiredState;
use crate::error::ReconcileError;
use crate::report::{write_report, RunReport};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const REPORT_DIR: &str = "pprov/runs";

/// Map a glue-level failure onto the error taxonomy for the report.
fn run_level_error(err: &anyhow::Error) -> ReconcileError {
    match err.downcast_ref::<ReconcileError>() {
        Some(domain) => domain.clone(),
        None => ReconcileError::Validation(format!("{err:#}")),
    }
}

/// Load the desired state, recording a failure in `report`.
fn load_desired(path: &Path, report: &mut RunReport) -> Option<DesiredState> {
    match config::load_desired_state(path) {
        Ok(desired) => Some(desired),
        Err(err) => {
            tracing::error!(config = %path.display(), error = %format!("{err:#}"), "config rejected");
            report.abort(&run_level_error(&err));
            None
        }
    }
}

/// Default location for reports of runs that may have changed something.
fn default_report_path(generated_at_epoch_ms: u128) -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| {
        dir.join(REPORT_DIR)
            .join(format!("{generated_at_epoch_ms}.json"))
    })
}

/// Print the report and persist it; returns the exit code.
fn finish(report: &RunReport, out: Option<&Path>, persist_by_default: bool) -> Result<i32> {
    let text = serde_json::to_string_pretty(report).context("serialize run report")?;
    println!("{text}");
    let target = match out {
        Some(path) => Some(path.to_path_buf()),
        None if persist_by_default => default_report_path(report.generated_at_epoch_ms),
        None => None,
    };
    if let Some(path) = target {
        write_report(&path, report)?;
        tracing::info!(path = %path.display(), "wrote run report");
    }
    tracing::info!(
        mode = ?report.mode,
        outcome = ?report.outcome,
        "run finished"
    );
    Ok(report.exit_code())
}
