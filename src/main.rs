//! `pprov`: provision a registry webhook and the cloud event pipeline behind it.
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod cloud;
mod config;
mod desired;
mod drift;
mod dry_run;
mod error;
mod fanout;
mod payload;
mod preflight;
mod registry;
mod report;
mod retry;
mod signal;
#[cfg(test)]
mod test_support;
mod util;
mod workflow;

use cli::{Command, RootArgs};
use fanout::CancelToken;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: RootArgs) -> Result<i32> {
    let out = args.out.as_deref();
    match &args.command {
        Command::Check(cmd) => workflow::run_check(cmd, out),
        Command::Reconcile(cmd) => {
            let cancel = CancelToken::new();
            signal::install_interrupt_handler(&cancel)?;
            workflow::run_reconcile(cmd, out, &cancel)
        }
        Command::Preflight(cmd) => workflow::run_preflight(cmd, out),
        Command::Drift(cmd) => workflow::run_drift(cmd, out),
        Command::SendEvent(cmd) => workflow::run_send_event(cmd),
    }
}

fn main() {
    let args = RootArgs::parse();
    init_tracing(&args.log_level);
    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    };
    std::process::exit(code);
}
