//! SIGINT handling. The first interrupt cancels the run so no new target is
//! dispatched; a second interrupt ends the process.
use crate::fanout::CancelToken;
use anyhow::{Context, Result};

/// Exit status for a run stopped by a second interrupt.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// What one interrupt does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    Cancel,
    Exit,
}

fn on_interrupt(token: &CancelToken) -> InterruptAction {
    if token.is_cancelled() {
        return InterruptAction::Exit;
    }
    token.cancel();
    InterruptAction::Cancel
}

/// Route Ctrl-C to `token`. Only one handler per process.
pub fn install_interrupt_handler(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || match on_interrupt(&token) {
        InterruptAction::Cancel => {
            eprintln!("interrupt: finishing in-flight targets; press Ctrl-C again to exit");
        }
        InterruptAction::Exit => std::process::exit(INTERRUPTED_EXIT_CODE),
    })
    .context("install interrupt handler")
}
