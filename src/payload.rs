//! Forwarding payload shapes and the sample-event sender.
//!
//! A queue message body is classified once into `ForwardPayload`. Entities
//! that are already formatted go through untouched; anything else is wrapped
//! into a minimal event entity.
use crate::util::{elapsed_ms, truncate_string};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use ureq::Agent;

pub const EVENT_BLUEPRINT: &str = "awsEvent";
const RESPONSE_LOG_MAX_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum ForwardPayload {
    /// Already carries `blueprint` and `identifier`.
    PreformattedEntity(Map<String, Value>),
    RawEvent(Value),
}

impl ForwardPayload {
    /// Classify a message body. Non-JSON bodies become `{"raw": body}`.
    pub fn classify(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => ForwardPayload::from_value(value),
            Err(_) => ForwardPayload::RawEvent(json!({ "raw": body })),
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) if map.contains_key("blueprint") && map.contains_key("identifier") => {
                ForwardPayload::PreformattedEntity(map)
            }
            other => ForwardPayload::RawEvent(other),
        }
    }

    /// Entity document to post. `now_ms` names events that carry no id.
    pub fn into_entity(self, now_ms: u128) -> Value {
        match self {
            ForwardPayload::PreformattedEntity(map) => Value::Object(map),
            ForwardPayload::RawEvent(event) => {
                let identifier = event_identifier(&event).unwrap_or_else(|| format!("aws-event-{now_ms}"));
                let title = non_empty_str(&event, "/detail-type")
                    .or_else(|| non_empty_str(&event, "/source"))
                    .map(str::to_string)
                    .unwrap_or_else(|| identifier.clone());
                json!({
                    "identifier": identifier,
                    "title": title,
                    "blueprint": EVENT_BLUEPRINT,
                    "properties": { "event": event },
                })
            }
        }
    }
}

fn non_empty_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}

fn event_identifier(event: &Value) -> Option<String> {
    let from_detail = if event.get("detail").is_some_and(Value::is_object) {
        non_empty_str(event, "/detail/resource")
            .or_else(|| non_empty_str(event, "/detail/requestParameters/bucketName"))
            .or_else(|| non_empty_str(event, "/id"))
            .or_else(|| non_empty_str(event, "/detail/arn"))
    } else {
        None
    };
    from_detail
        .or_else(|| non_empty_str(event, "/id"))
        .map(str::to_string)
}

/// Post one event document to a webhook. Any status of 400 or above is an error.
pub fn send_event(webhook_url: &str, body: &Value, timeout: Duration) -> Result<(u16, String)> {
    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    let agent = Agent::new_with_config(config);
    let started = Instant::now();
    let mut response = agent
        .post(webhook_url)
        .header("Accept", "application/json")
        .send_json(body)
        .with_context(|| format!("POST {webhook_url}"))?;
    let status = response.status().as_u16();
    let text = response
        .body_mut()
        .read_to_string()
        .with_context(|| format!("read response from {webhook_url}"))?;
    tracing::info!(
        elapsed_ms = elapsed_ms(started),
        status,
        response_bytes = text.len(),
        "webhook post complete"
    );
    if status >= 400 {
        return Err(anyhow!(
            "webhook rejected event with HTTP {status}: {}",
            truncate_string(text.trim(), RESPONSE_LOG_MAX_BYTES)
        ));
    }
    Ok((status, text))
}
