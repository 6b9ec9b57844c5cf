//! Registry upserts, in dependency order: schemas, then the webhook, then the
//! integration mapping config.
use super::webhook::resolve_webhook;
use super::{
    read_back_on_conflict, RegistryApi, RegistryOutcome, RegistryResourceKind,
    RegistryResourceOutcome,
};
use crate::desired::DesiredState;
use crate::drift;
use crate::error::{ReconcileError, ReconcileResult};
use crate::report::ReconcileStatus;
use serde_json::{json, Map, Value};

/// Server-managed integration fields stripped before a patch.
const READ_ONLY_INTEGRATION_FIELDS: [&str; 3] = ["createdAt", "updatedAt", "ok"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub ingest_base_url: String,
    /// Retry a config update through the config subresource when the full
    /// patch did not take.
    pub force_config_subresource: bool,
}

pub struct RegistryReconciler<'a> {
    registry: &'a dyn RegistryApi,
    settings: RegistrySettings,
}

impl<'a> RegistryReconciler<'a> {
    pub fn new(registry: &'a dyn RegistryApi, settings: RegistrySettings) -> Self {
        RegistryReconciler { registry, settings }
    }

    pub fn reconcile(&self, desired: &DesiredState) -> ReconcileResult<RegistryOutcome> {
        let schemas = validate_schemas(&desired.documents.schemas)?;
        let mut resources = Vec::new();

        for (identifier, document) in schemas {
            let status = self
                .upsert_schema(identifier, document)
                .map_err(|err| err.context(&format!("schema {identifier}")))?;
            resources.push(RegistryResourceOutcome {
                kind: RegistryResourceKind::Schema,
                identifier: identifier.to_string(),
                status,
            });
        }

        let webhook = resolve_webhook(
            self.registry,
            &desired.webhook_spec,
            &self.settings.ingest_base_url,
            &desired.registry_integration_id,
            desired.documents.webhook_mappings.as_ref(),
        )
        .map_err(|err| err.context(&format!("webhook {}", desired.webhook_spec)))?;
        if let (Some(identifier), Some(status)) = (&webhook.identifier, webhook.status) {
            resources.push(RegistryResourceOutcome {
                kind: RegistryResourceKind::Webhook,
                identifier: identifier.clone(),
                status,
            });
        }

        let status = self
            .upsert_integration(desired)
            .map_err(|err| err.context(&format!("integration {}", desired.registry_integration_id)))?;
        resources.push(RegistryResourceOutcome {
            kind: RegistryResourceKind::Integration,
            identifier: desired.registry_integration_id.clone(),
            status,
        });

        tracing::info!(
            webhook_url = %webhook.url,
            resources = resources.len(),
            "registry reconcile complete"
        );
        Ok(RegistryOutcome {
            webhook_url: webhook.url,
            resources,
        })
    }

    fn upsert_schema(&self, identifier: &str, desired: &Value) -> ReconcileResult<ReconcileStatus> {
        let Some(live) = self.registry.get_blueprint(identifier)? else {
            if let Err(err) = self.registry.create_blueprint(desired) {
                let existing = read_back_on_conflict(err, || self.registry.get_blueprint(identifier))?;
                if !drift::diff(&existing, desired).is_clean() {
                    check_schema_compatible(identifier, &existing, desired)?;
                    self.registry.replace_blueprint(identifier, desired)?;
                }
            }
            tracing::info!(schema = identifier, "created schema");
            return Ok(ReconcileStatus::Created);
        };
        check_schema_compatible(identifier, &live, desired)?;
        if drift::diff(&live, desired).is_clean() {
            tracing::debug!(schema = identifier, "schema unchanged");
            return Ok(ReconcileStatus::Unchanged);
        }
        self.registry.replace_blueprint(identifier, desired)?;
        tracing::info!(schema = identifier, "replaced schema");
        Ok(ReconcileStatus::Updated)
    }

    fn upsert_integration(&self, desired: &DesiredState) -> ReconcileResult<ReconcileStatus> {
        let id = desired.registry_integration_id.as_str();
        let config = &desired.documents.mapping_config;
        let Some(live) = self.registry.get_integration(id)? else {
            let document = json!({
                "installationId": id,
                "installationAppType": desired.integration_type,
                "version": desired.integration_version,
                "changelogDestination": {},
                "config": config,
            });
            if let Err(err) = self.registry.create_integration(&document) {
                let existing = read_back_on_conflict(err, || self.registry.get_integration(id))?;
                self.sync_integration(desired, &existing)?;
            }
            tracing::info!(integration = id, "created integration");
            return Ok(ReconcileStatus::Created);
        };
        self.sync_integration(desired, &live)
    }

    /// Bring an existing integration's config and version in line.
    fn sync_integration(&self, desired: &DesiredState, live: &Value) -> ReconcileResult<ReconcileStatus> {
        let id = desired.registry_integration_id.as_str();
        let config = &desired.documents.mapping_config;
        let live_config = live.get("config").cloned().unwrap_or(Value::Null);
        let version_differs = live
            .get("version")
            .and_then(Value::as_str)
            .is_some_and(|version| version != desired.integration_version);
        if drift::diff(&live_config, config).is_clean() && !version_differs {
            tracing::debug!(integration = id, "integration unchanged");
            return Ok(ReconcileStatus::Unchanged);
        }

        let mut patch: Map<String, Value> = live.as_object().cloned().unwrap_or_default();
        for field in READ_ONLY_INTEGRATION_FIELDS {
            patch.remove(field);
        }
        patch.insert("config".to_string(), config.clone());
        patch.insert(
            "version".to_string(),
            Value::String(desired.integration_version.clone()),
        );
        let response = self.registry.update_integration(id, &Value::Object(patch))?;
        if self.config_applied(id, &response, config)? {
            tracing::info!(integration = id, "updated integration config");
            return Ok(ReconcileStatus::Updated);
        }

        if !self.settings.force_config_subresource {
            return Err(ReconcileError::Conflict(
                "registry accepted the update but did not apply the mapping config".to_string(),
            ));
        }
        tracing::warn!(integration = id, "config did not take, retrying through config subresource");
        let response = self.registry.update_integration_config(id, config)?;
        if self.config_applied(id, &response, config)? {
            tracing::info!(integration = id, "updated integration config via subresource");
            return Ok(ReconcileStatus::Updated);
        }
        Err(ReconcileError::Conflict(
            "mapping config still differs after config subresource update".to_string(),
        ))
    }

    /// Check the write response, or the live document when the response
    /// carries no config.
    fn config_applied(&self, id: &str, response: &Value, desired: &Value) -> ReconcileResult<bool> {
        let applied = match response.get("config") {
            Some(config) => config.clone(),
            None => self
                .registry
                .get_integration(id)?
                .and_then(|live| live.get("config").cloned())
                .unwrap_or(Value::Null),
        };
        Ok(drift::diff(&applied, desired).is_clean())
    }
}

/// Validate every schema document before any write.
fn validate_schemas(schemas: &[Value]) -> ReconcileResult<Vec<(&str, &Value)>> {
    let mut validated = Vec::with_capacity(schemas.len());
    for (index, document) in schemas.iter().enumerate() {
        if !document.is_object() {
            return Err(ReconcileError::Validation(format!(
                "schema document #{index} is not an object"
            )));
        }
        let identifier = document
            .get("identifier")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ReconcileError::Validation(format!(
                    "schema document #{index} has no string identifier"
                ))
            })?;
        if let Some(schema) = document.get("schema") {
            if !schema.is_object() {
                return Err(ReconcileError::Validation(format!(
                    "schema {identifier}: `schema` must be an object"
                )));
            }
        }
        if validated.iter().any(|(seen, _)| *seen == identifier) {
            return Err(ReconcileError::Validation(format!(
                "schema {identifier} is declared twice"
            )));
        }
        validated.push((identifier, document));
    }
    Ok(validated)
}

/// A property whose declared type changes cannot be updated in place.
fn check_schema_compatible(identifier: &str, live: &Value, desired: &Value) -> ReconcileResult<()> {
    let properties = |doc: &Value| doc.pointer("/schema/properties").and_then(Value::as_object).cloned();
    let (Some(live_props), Some(desired_props)) = (properties(live), properties(desired)) else {
        return Ok(());
    };
    for (name, desired_prop) in &desired_props {
        let live_type = live_props.get(name).and_then(|prop| prop.get("type"));
        let desired_type = desired_prop.get("type");
        if let (Some(live_type), Some(desired_type)) = (live_type, desired_type) {
            if live_type != desired_type {
                return Err(ReconcileError::Conflict(format!(
                    "schema {identifier}: property {name} changes type from {live_type} to {desired_type}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
