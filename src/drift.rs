//! Read-only drift detection between live registry config and the local
//! mapping document.
//!
//! The desired document is an overlay: fields it does not mention are never
//! drift, because the live side may hold fields owned by other tooling.
use crate::desired::DesiredState;
use crate::error::{ReconcileError, ReconcileResult};
use crate::registry::RegistryApi;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Keys that identify an element inside an array of objects.
const ARRAY_IDENTITY_KEYS: [&str; 2] = ["kind", "identifier"];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DriftEntry {
    pub field: String,
    pub live_value: Option<Value>,
    pub desired_value: Value,
}

/// Ordered drift entries; empty means no drift.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(transparent)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "no drift".to_string();
        }
        self.entries
            .iter()
            .map(|entry| {
                let live = entry
                    .live_value
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "<missing>".to_string());
                format!("{}: live={} desired={}", entry.field, live, entry.desired_value)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Canonical form: object keys sorted, strings trimmed with inner whitespace
/// runs collapsed to one space.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.split_whitespace().collect::<Vec<_>>().join(" ")),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(key, value)| (key, canonicalize(value))).collect();
            let mut out = Map::new();
            for (key, value) in sorted {
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Diff `desired` as an overlay on `live`.
pub fn diff(live: &Value, desired: &Value) -> DriftReport {
    let mut entries = Vec::new();
    diff_value("", Some(&canonicalize(live)), &canonicalize(desired), &mut entries);
    DriftReport { entries }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn diff_value(path: &str, live: Option<&Value>, desired: &Value, entries: &mut Vec<DriftEntry>) {
    match (live, desired) {
        (Some(Value::Object(live_map)), Value::Object(desired_map)) => {
            for (key, desired_child) in desired_map {
                diff_value(&child_path(path, key), live_map.get(key), desired_child, entries);
            }
        }
        (Some(Value::Array(live_items)), Value::Array(desired_items)) => {
            match (identity_key(live_items), identity_key(desired_items)) {
                (Some(live_key), Some(desired_key)) if live_key == desired_key => {
                    diff_keyed_arrays(path, desired_key, live_items, desired_items, entries);
                }
                _ => {
                    if live_items != desired_items {
                        push_entry(path, live, desired, entries);
                    }
                }
            }
        }
        (Some(live_value), desired_value) if live_value == desired_value => {}
        _ => push_entry(path, live, desired, entries),
    }
}

fn push_entry(path: &str, live: Option<&Value>, desired: &Value, entries: &mut Vec<DriftEntry>) {
    let field = if path.is_empty() { "$" } else { path };
    entries.push(DriftEntry {
        field: field.to_string(),
        live_value: live.cloned(),
        desired_value: desired.clone(),
    });
}

/// Identity key shared by every element, if the array is a keyed list.
fn identity_key(items: &[Value]) -> Option<&'static str> {
    if items.is_empty() {
        return None;
    }
    ARRAY_IDENTITY_KEYS.into_iter().find(|key| {
        items
            .iter()
            .all(|item| item.get(*key).and_then(Value::as_str).is_some())
    })
}

fn diff_keyed_arrays(
    path: &str,
    key: &str,
    live_items: &[Value],
    desired_items: &[Value],
    entries: &mut Vec<DriftEntry>,
) {
    let live_index: BTreeMap<&str, &Value> = live_items
        .iter()
        .filter_map(|item| item.get(key).and_then(Value::as_str).map(|id| (id, item)))
        .collect();
    for desired_item in desired_items {
        let Some(id) = desired_item.get(key).and_then(Value::as_str) else {
            continue;
        };
        let element_path = format!("{path}[{key}={id}]");
        diff_value(&element_path, live_index.get(id).copied(), desired_item, entries);
    }
}

/// Live-config reader for drift verification. Performs exactly one read.
pub struct DriftVerifier<'a> {
    registry: &'a dyn RegistryApi,
}

impl<'a> DriftVerifier<'a> {
    pub fn new(registry: &'a dyn RegistryApi) -> Self {
        DriftVerifier { registry }
    }

    pub fn verify(&self, desired: &DesiredState) -> ReconcileResult<DriftReport> {
        let integration = self
            .registry
            .get_integration(&desired.registry_integration_id)?
            .ok_or_else(|| {
                ReconcileError::Validation(format!(
                    "integration {} does not exist in the registry",
                    desired.registry_integration_id
                ))
            })?;
        let live_config = integration.get("config").cloned().unwrap_or(Value::Null);
        let report = diff(&live_config, &desired.documents.mapping_config);
        tracing::info!(
            integration = %desired.registry_integration_id,
            drift_entries = report.entries.len(),
            "drift verification complete"
        );
        Ok(report)
    }
}
