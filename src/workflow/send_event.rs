//! Sample event sender for end-to-end smoke tests of a webhook.
use crate::cli::SendEventArgs;
use crate::config::load_document;
use crate::payload::{send_event, ForwardPayload};
use crate::util::now_epoch_ms;
use anyhow::Result;
use std::time::Duration;

/// Post the event file to the webhook and print the response body.
pub fn run_send_event(args: &SendEventArgs) -> Result<i32> {
    let event = load_document(&args.event)?;
    let body = if args.shape {
        ForwardPayload::from_value(event).into_entity(now_epoch_ms()?)
    } else {
        event
    };
    let (status, text) = send_event(
        &args.webhook_url,
        &body,
        Duration::from_secs(args.timeout_secs.max(1)),
    )?;
    println!("{text}");
    tracing::info!(status, "event accepted");
    Ok(0)
}
