//! Drift verification, live or against a saved integration document.
use super::settings::{retry_policy, RegistryRunSettings};
use super::{finish, load_desired, run_level_error};
use crate::cli::DriftArgs;
use crate::config::load_document;
use crate::desired::DesiredState;
use crate::drift::{self, DriftReport, DriftVerifier};
use crate::error::ReconcileResult;
use crate::registry::{unwrap_envelope, HttpRegistry};
use crate::report::{RunMode, RunOutcome, RunReport};
use crate::util::now_epoch_ms;
use anyhow::Result;
use std::path::Path;

/// Diff a saved integration (or bare config) document against the desired config.
fn diff_saved(path: &Path, desired: &DesiredState) -> Result<DriftReport> {
    let document = unwrap_envelope(load_document(path)?, &["integration"]);
    let live_config = document.get("config").cloned().unwrap_or(document);
    Ok(drift::diff(&live_config, &desired.documents.mapping_config))
}

fn verify_live(args: &DriftArgs, desired: &DesiredState) -> ReconcileResult<DriftReport> {
    let retry = retry_policy(&args.retry);
    let connection = RegistryRunSettings::from_args(&args.registry).connection(retry)?;
    let registry = HttpRegistry::connect(&connection)?;
    DriftVerifier::new(&registry).verify(desired)
}

/// Report differences between live and desired integration config. Drift
/// fails the run so scripts can gate on it.
pub fn run_drift(args: &DriftArgs, out: Option<&Path>) -> Result<i32> {
    let mut report = RunReport::new(RunMode::Drift, now_epoch_ms()?);
    let Some(desired) = load_desired(&args.config, &mut report) else {
        return finish(&report, out, false);
    };

    let outcome = match &args.live_file {
        Some(path) => diff_saved(path, &desired).map_err(|err| run_level_error(&err)),
        None => verify_live(args, &desired),
    };
    match outcome {
        Ok(drift_report) => {
            if drift_report.is_clean() {
                tracing::info!("no drift");
            } else {
                eprintln!("{}", drift_report.render());
                report.outcome = RunOutcome::Failed;
            }
            report.drift = Some(drift_report);
        }
        Err(err) => report.abort(&err),
    }
    finish(&report, out, false)
}
