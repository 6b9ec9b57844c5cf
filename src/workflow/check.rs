//! Offline validation of the desired-state file.
use super::{finish, load_desired};
use crate::cli::CheckArgs;
use crate::report::{RunMode, RunReport};
use crate::util::now_epoch_ms;
use anyhow::Result;
use std::path::Path;

/// Load and validate the config; contacts neither control plane.
pub fn run_check(args: &CheckArgs, out: Option<&Path>) -> Result<i32> {
    let mut report = RunReport::new(RunMode::Check, now_epoch_ms()?);
    if let Some(desired) = load_desired(&args.config, &mut report) {
        let targets = desired
            .fanout_targets
            .as_ref()
            .map(|fanout| fanout.targets().len())
            .unwrap_or(0);
        tracing::info!(
            schemas = desired.documents.schemas.len(),
            event_sources = %desired.event_sources_csv(),
            fanout_targets = targets,
            "config valid"
        );
    }
    finish(&report, out, false)
}
