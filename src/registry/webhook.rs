//! Webhook identity resolution.
//!
//! Every accepted `WebhookSpec` form resolves to one canonical ingest URL.
//! Identifier lookups reuse an existing webhook before creating one, so
//! re-running with the same identifier never creates a duplicate.
use super::{read_back_on_conflict, RegistryApi};
use crate::desired::WebhookSpec;
use crate::drift;
use crate::error::{ReconcileError, ReconcileResult};
use crate::report::ReconcileStatus;
use serde_json::{json, Value};

/// Bare webhook keys shorter than this are treated as identifiers.
const MIN_WEBHOOK_KEY_LENGTH: usize = 10;
const WEBHOOK_TITLE: &str = "AWS Serverless Webhook";

const URL_FIELDS: [&[&str]; 3] = [&["url"], &["integration", "url"], &["webhook", "url"]];
const KEY_FIELDS: [&[&str]; 5] = [
    &["webhookKey"],
    &["integration", "webhookKey"],
    &["webhook", "webhookKey"],
    &["id"],
    &["_id"],
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWebhook {
    pub url: String,
    /// Registry identifier when the webhook was looked up or created.
    pub identifier: Option<String>,
    /// Set when the webhook resource itself was reconciled.
    pub status: Option<ReconcileStatus>,
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

fn is_webhook_key(candidate: &str) -> bool {
    candidate.len() >= MIN_WEBHOOK_KEY_LENGTH && candidate.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// Pull the canonical ingest URL out of a webhook document.
pub fn extract_webhook_url(document: &Value, ingest_base_url: &str) -> Option<String> {
    let base = ingest_base_url.trim_end_matches('/');
    for path in URL_FIELDS {
        if let Some(url) = lookup(document, path).and_then(Value::as_str) {
            if url.starts_with(base) {
                return Some(url.to_string());
            }
        }
    }
    for path in KEY_FIELDS {
        if let Some(key) = lookup(document, path).and_then(Value::as_str) {
            if is_webhook_key(key) {
                return Some(format!("{base}/{key}"));
            }
        }
    }
    None
}

fn new_webhook_document(identifier: &str, integration_id: &str, mappings: Option<&Value>) -> Value {
    json!({
        "identifier": identifier,
        "title": WEBHOOK_TITLE,
        "description": format!("Ingest webhook for integration {integration_id}"),
        "integrationIdentifier": integration_id,
        "enabled": true,
        "security": {
            "secret": "",
            "signatureHeaderName": "",
            "signatureAlgorithm": "sha256",
            "signaturePrefix": "",
            "requestIdentifierPath": ""
        },
        "mappings": mappings.cloned().unwrap_or_else(|| json!([])),
    })
}

/// Resolve `spec` to a canonical URL, creating or updating the webhook when
/// the spec names one by identifier.
pub fn resolve_webhook(
    registry: &dyn RegistryApi,
    spec: &WebhookSpec,
    ingest_base_url: &str,
    integration_id: &str,
    mappings: Option<&Value>,
) -> ReconcileResult<ResolvedWebhook> {
    let base = ingest_base_url.trim_end_matches('/');
    let identifier = match spec {
        WebhookSpec::AbsoluteUrl(url) => {
            return Ok(ResolvedWebhook {
                url: url.clone(),
                identifier: None,
                status: None,
            });
        }
        WebhookSpec::Identifier(_) | WebhookSpec::PathFragment(_) => spec
            .identifier()
            .ok_or_else(|| ReconcileError::Validation(format!("webhook {spec} has no identifier")))?,
    };

    if matches!(spec, WebhookSpec::Identifier(_)) && is_webhook_key(identifier) {
        tracing::debug!(webhook = identifier, "treating bare identifier as webhook key");
        return Ok(ResolvedWebhook {
            url: format!("{base}/{identifier}"),
            identifier: None,
            status: None,
        });
    }

    match registry.get_webhook(identifier)? {
        Some(live) => {
            let url = extract_webhook_url(&live, base).ok_or_else(|| {
                ReconcileError::Conflict(format!(
                    "webhook {identifier} exists but exposes no ingest URL under {base}"
                ))
            })?;
            let status = match mappings {
                Some(desired) => {
                    let overlay = json!({ "mappings": desired });
                    if drift::diff(&live, &overlay).is_clean() {
                        ReconcileStatus::Unchanged
                    } else {
                        registry.update_webhook(identifier, &overlay)?;
                        tracing::info!(webhook = identifier, "updated webhook mappings");
                        ReconcileStatus::Updated
                    }
                }
                None => ReconcileStatus::Unchanged,
            };
            Ok(ResolvedWebhook {
                url,
                identifier: Some(identifier.to_string()),
                status: Some(status),
            })
        }
        None => {
            let document = new_webhook_document(identifier, integration_id, mappings);
            let created = match registry.create_webhook(&document) {
                Ok(created) => created,
                Err(err) => read_back_on_conflict(err, || registry.get_webhook(identifier))?,
            };
            let url = extract_webhook_url(&created, base).ok_or_else(|| {
                ReconcileError::Fatal(format!(
                    "created webhook {identifier} but the response carried no ingest URL"
                ))
            })?;
            tracing::info!(webhook = identifier, url = %url, "created webhook");
            Ok(ResolvedWebhook {
                url,
                identifier: Some(identifier.to_string()),
                status: Some(ReconcileStatus::Created),
            })
        }
    }
}
