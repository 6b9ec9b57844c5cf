//! Registry control plane: schema definitions, the ingest webhook, and the
//! integration mapping config.
//!
//! `RegistryApi` is the seam between reconciliation logic and transport. The
//! HTTP client and the dry-run recorder both implement it.
mod http;
mod reconcile;
mod webhook;

pub use http::{HttpRegistry, RegistryConnection, RegistryCredential};
pub use reconcile::{RegistryReconciler, RegistrySettings};
pub use webhook::{extract_webhook_url, resolve_webhook, ResolvedWebhook};

use crate::error::{ErrorKind, ReconcileError, ReconcileResult};
use crate::report::ReconcileStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Registry operations the reconciler consumes. Reads return the unwrapped
/// document or `None` when the resource does not exist.
pub trait RegistryApi {
    fn get_blueprint(&self, identifier: &str) -> ReconcileResult<Option<Value>>;
    fn create_blueprint(&self, document: &Value) -> ReconcileResult<Value>;
    fn replace_blueprint(&self, identifier: &str, document: &Value) -> ReconcileResult<Value>;

    fn get_webhook(&self, identifier: &str) -> ReconcileResult<Option<Value>>;
    fn create_webhook(&self, document: &Value) -> ReconcileResult<Value>;
    fn update_webhook(&self, identifier: &str, document: &Value) -> ReconcileResult<Value>;

    fn get_integration(&self, identifier: &str) -> ReconcileResult<Option<Value>>;
    fn create_integration(&self, document: &Value) -> ReconcileResult<Value>;
    fn update_integration(&self, identifier: &str, document: &Value) -> ReconcileResult<Value>;
    /// Replace only the config subresource of an integration.
    fn update_integration_config(&self, identifier: &str, config: &Value)
        -> ReconcileResult<Value>;
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistryResourceKind {
    Schema,
    Webhook,
    Integration,
}

impl RegistryResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryResourceKind::Schema => "schema",
            RegistryResourceKind::Webhook => "webhook",
            RegistryResourceKind::Integration => "integration",
        }
    }
}

impl fmt::Display for RegistryResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RegistryResourceOutcome {
    pub kind: RegistryResourceKind,
    pub identifier: String,
    pub status: ReconcileStatus,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RegistryOutcome {
    pub webhook_url: String,
    pub resources: Vec<RegistryResourceOutcome>,
}

impl RegistryOutcome {
    pub fn all_unchanged(&self) -> bool {
        self.resources
            .iter()
            .all(|resource| resource.status == ReconcileStatus::Unchanged)
    }
}

/// Strip a single-key response envelope such as `{"ok": true, "blueprint": {...}}`.
pub(crate) fn unwrap_envelope(value: Value, keys: &[&str]) -> Value {
    for key in keys {
        if let Some(inner) = value.get(*key) {
            if inner.is_object() {
                return inner.clone();
            }
        }
    }
    value
}

/// A create retried after its response was lost meets the resource it already
/// made and fails with a conflict. Read the resource back and use it; any
/// other error, or a conflict with nothing to read back, is returned as is.
pub(crate) fn read_back_on_conflict(
    err: ReconcileError,
    read_back: impl FnOnce() -> ReconcileResult<Option<Value>>,
) -> ReconcileResult<Value> {
    if err.kind() != ErrorKind::Conflict {
        return Err(err);
    }
    match read_back()? {
        Some(existing) => {
            tracing::info!(error = %err, "create conflicted with an existing resource, reading it back");
            Ok(existing)
        }
        None => Err(err),
    }
}
