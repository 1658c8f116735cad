//! Defsmith schema: derives a structural parameter schema from a schematic and
//! publishes it as a labeled ConfigMap next to the owning definition.

#![forbid(unsafe_code)]

use std::sync::Arc;

use defsmith_core::{
    Definition, DefinitionError, DefinitionKind, ObjectKey, Parameter, Schematic, SchematicEngine, ANNOTATION_REVISION,
    LABEL_DEFINITION_NAME,
};
use defsmith_revision::{revision_index, Revision};
use defsmith_store::{resource_version, ObjectStore, StoreError};
use metrics::counter;
use serde::Serialize;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, info};

mod cue;
mod terraform;

pub use cue::parameter_schema;
pub use terraform::variables_schema;

pub const CONFIGMAP_KIND: &str = "ConfigMap";
pub const SCHEMA_DATA_KEY: &str = "openapi-v3-json-schema";
pub const DEFAULT_SCHEMA_PREFIX: &str = "schema-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaDerivationError {
    #[error("template parse error at byte {offset}: {reason}")]
    Parse { offset: usize, reason: String },
    #[error("schema derivation is not supported for {0} schematics")]
    Unsupported(SchematicEngine),
}

/// `<capability-type>-<prefix><owner>`, e.g. `trait-schema-scaler`.
pub fn artifact_name(kind: DefinitionKind, prefix: &str, owner: &str) -> String {
    format!("{}-{}{}", kind.capability_type(), prefix, owner)
}

/// Turns a schematic into a parameter schema. `Ok(None)` means there is
/// nothing to publish.
pub trait SchemaDeriver: Send + Sync {
    fn derive(&self, schematic: &Schematic) -> Result<Option<Json>, SchemaDerivationError>;
}

/// In-process derivation for every engine that carries its parameters in the
/// schematic itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDeriver;

impl SchemaDeriver for BuiltinDeriver {
    fn derive(&self, schematic: &Schematic) -> Result<Option<Json>, SchemaDerivationError> {
        match schematic {
            Schematic::Cue(c) => parameter_schema(&c.template),
            Schematic::Kube(k) => Ok(Some(kube_parameters_schema(k.parameters()))),
            Schematic::Terraform(t) if t.is_remote() => Ok(None),
            Schematic::Terraform(t) => variables_schema(&t.configuration),
            Schematic::Helm(_) => Ok(None),
        }
    }
}

/// Property type: the declared `type`, else inferred from the default, else `string`.
pub fn kube_parameters_schema(params: &[Parameter]) -> Json {
    let mut props = Map::new();
    let mut required = Vec::new();
    for p in params {
        let mut prop = Map::new();
        let ty = p
            .value_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| p.default.as_ref().and_then(terraform::infer_type).map(str::to_string))
            .unwrap_or_else(|| "string".to_string());
        prop.insert("type".into(), json!(ty));
        if let Some(d) = p.description.as_deref().filter(|d| !d.is_empty()) {
            prop.insert("description".into(), json!(d));
        }
        if let Some(d) = &p.default {
            prop.insert("default".into(), d.clone());
        }
        if p.is_required() {
            required.push(json!(p.name));
        }
        props.insert(p.name.clone(), Json::Object(prop));
    }
    let mut obj = Map::new();
    obj.insert("type".into(), json!("object"));
    obj.insert("properties".into(), Json::Object(props));
    if !required.is_empty() {
        obj.insert("required".into(), Json::Array(required));
    }
    Json::Object(obj)
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Derivation(#[from] SchemaDerivationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("schema artifact {name} kept conflicting after {attempts} attempts")]
    Conflict { name: String, attempts: u32 },
    #[error("malformed schema artifact {name}: {reason}")]
    Malformed { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishOutcome {
    Created,
    Updated,
    /// Stored content already matched; nothing was written.
    Unchanged,
    /// No derivable parameter section.
    Skipped,
    /// No derivable parameter section; the artifact of an older revision was deleted.
    Removed,
    /// The stored artifact comes from a newer revision than the one offered.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub outcome: PublishOutcome,
    /// Artifact key; `None` when skipped.
    pub artifact: Option<ObjectKey>,
}

pub struct SchemaPublisher {
    store: Arc<dyn ObjectStore>,
    deriver: Arc<dyn SchemaDeriver>,
    prefix: String,
    max_attempts: u32,
}

impl SchemaPublisher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, deriver: Arc::new(BuiltinDeriver), prefix: DEFAULT_SCHEMA_PREFIX.to_string(), max_attempts: 5 }
    }

    pub fn with_deriver(mut self, deriver: Arc<dyn SchemaDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn prefix(&self) -> &str { &self.prefix }

    pub fn artifact_key(&self, owner: &Definition) -> Result<ObjectKey, DefinitionError> {
        let kind = owner.kind()?;
        Ok(ObjectKey::new(CONFIGMAP_KIND, owner.namespace(), artifact_name(kind, &self.prefix, owner.name())))
    }

    /// Derive and publish the schema of `revision`'s schematic.
    ///
    /// An artifact produced from a newer revision of the same owner is never
    /// overwritten or removed; the call reports [`PublishOutcome::Superseded`].
    pub async fn publish(&self, owner: &Definition, revision: &Revision) -> Result<Publication, PublishError> {
        let key = self.artifact_key(owner)?;
        let schema = match &revision.schematic {
            Some(s) => self.deriver.derive(s)?,
            None => None,
        };
        let Some(schema) = schema else {
            return self.retract(owner, &key, &revision.name).await;
        };
        let rendered = serde_json::to_string_pretty(&schema)
            .map_err(|e| PublishError::Malformed { name: key.name.clone(), reason: e.to_string() })?;

        for _ in 0..self.max_attempts {
            let result = match self.store.get_opt(&key).await? {
                None => self.store.create(self.desired(owner, &key, &rendered, &revision.name)).await.map(|_| PublishOutcome::Created),
                Some(existing) if is_current(&existing, owner.name(), &rendered) => {
                    counter!("schema_publish_noop_total", 1u64);
                    debug!(artifact = %key, "schema unchanged");
                    return Ok(Publication { outcome: PublishOutcome::Unchanged, artifact: Some(key) });
                }
                Some(existing) if is_newer(&existing, owner, &revision.name) => {
                    info!(artifact = %key, offered = %revision.name, "schema artifact belongs to a newer revision");
                    return Ok(Publication { outcome: PublishOutcome::Superseded, artifact: Some(key) });
                }
                Some(mut existing) => {
                    let version = resource_version(&existing).to_string();
                    overlay(&mut existing, owner, &rendered, &revision.name);
                    self.store.update(existing, &version).await.map(|_| PublishOutcome::Updated)
                }
            };
            match result {
                Ok(outcome) => {
                    counter!("schema_publish_total", 1u64);
                    info!(artifact = %key, ?outcome, "schema published");
                    return Ok(Publication { outcome, artifact: Some(key) });
                }
                Err(e) if e.is_conflict() => {
                    debug!(artifact = %key, error = %e, "schema publish raced; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PublishError::Conflict { name: key.name, attempts: self.max_attempts })
    }

    /// Nothing derivable: delete the owner's artifact left by an older revision.
    async fn retract(&self, owner: &Definition, key: &ObjectKey, revision: &str) -> Result<Publication, PublishError> {
        for _ in 0..self.max_attempts {
            let existing = match self.store.get_opt(key).await? {
                Some(cm) if owned_by(&cm, owner.name()) => cm,
                _ => {
                    debug!(owner = %owner.key(), "no parameter schema to publish");
                    return Ok(Publication { outcome: PublishOutcome::Skipped, artifact: None });
                }
            };
            if is_newer(&existing, owner, revision) {
                return Ok(Publication { outcome: PublishOutcome::Superseded, artifact: Some(key.clone()) });
            }
            match self.store.delete(key, resource_version(&existing)).await {
                Ok(()) => {
                    counter!("schema_retract_total", 1u64);
                    info!(artifact = %key, "schema artifact removed; schematic declares no parameters");
                    return Ok(Publication { outcome: PublishOutcome::Removed, artifact: None });
                }
                Err(e) if e.is_conflict() => debug!(artifact = %key, "schema removal raced; retrying"),
                Err(e) if e.is_not_found() => return Ok(Publication { outcome: PublishOutcome::Skipped, artifact: None }),
                Err(e) => return Err(e.into()),
            }
        }
        Err(PublishError::Conflict { name: key.name.clone(), attempts: self.max_attempts })
    }

    /// The published schema for `owner`, if any.
    pub async fn fetch(&self, owner: &Definition) -> Result<Option<Json>, PublishError> {
        let key = self.artifact_key(owner)?;
        let Some(cm) = self.store.get_opt(&key).await? else { return Ok(None) };
        let Some(text) = cm.get("data").and_then(|d| d.get(SCHEMA_DATA_KEY)).and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| PublishError::Malformed { name: key.name, reason: e.to_string() })
    }

    fn desired(&self, owner: &Definition, key: &ObjectKey, rendered: &str, revision: &str) -> Json {
        let mut meta = json!({
            "name": key.name,
            "namespace": key.namespace,
            "labels": { LABEL_DEFINITION_NAME: owner.name() },
            "annotations": { ANNOTATION_REVISION: revision },
        });
        if let Some(reference) = owner_reference(owner) {
            meta["ownerReferences"] = json!([reference]);
        }
        json!({
            "apiVersion": "v1",
            "kind": CONFIGMAP_KIND,
            "metadata": meta,
            "data": { SCHEMA_DATA_KEY: rendered },
        })
    }
}

fn owner_reference(owner: &Definition) -> Option<Json> {
    let uid = owner.as_value().pointer("/metadata/uid").and_then(|v| v.as_str())?;
    Some(json!({
        "apiVersion": owner.as_value().get("apiVersion").cloned().unwrap_or(Json::Null),
        "kind": owner.kind_str(),
        "name": owner.name(),
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    }))
}

fn controller_uid(existing: &Json) -> Option<&str> {
    existing
        .pointer("/metadata/ownerReferences")?
        .as_array()?
        .iter()
        .find(|r| r.get("controller").and_then(Json::as_bool) == Some(true))
        .and_then(|r| r.get("uid"))
        .and_then(Json::as_str)
}

fn owned_by(existing: &Json, owner: &str) -> bool {
    existing
        .pointer("/metadata/labels")
        .and_then(|l| l.get(LABEL_DEFINITION_NAME))
        .and_then(|v| v.as_str())
        == Some(owner)
}

/// Content equality only; the revision annotation is not compared.
fn is_current(existing: &Json, owner: &str, rendered: &str) -> bool {
    let data_ok = existing.pointer("/data").and_then(|d| d.get(SCHEMA_DATA_KEY)).and_then(|v| v.as_str()) == Some(rendered);
    data_ok && owned_by(existing, owner)
}

/// The stored artifact was produced from a later revision of this same owner
/// object than `revision`. An artifact left by an earlier object of the same
/// name (different controller uid) never fences.
fn is_newer(existing: &Json, owner: &Definition, revision: &str) -> bool {
    let Some(ours) = revision_index(revision) else { return false };
    let theirs = existing
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ANNOTATION_REVISION))
        .and_then(|v| v.as_str())
        .and_then(revision_index);
    let same_object = match owner.as_value().pointer("/metadata/uid").and_then(Json::as_str) {
        Some(uid) => controller_uid(existing) == Some(uid),
        None => true,
    };
    owned_by(existing, owner.name()) && same_object && theirs.map_or(false, |t| t > ours)
}

fn overlay(existing: &mut Json, owner: &Definition, rendered: &str, revision: &str) {
    let Some(obj) = existing.as_object_mut() else { return };
    let data = obj.entry("data").or_insert_with(|| json!({}));
    if !data.is_object() { *data = json!({}); }
    data[SCHEMA_DATA_KEY] = json!(rendered);
    let meta = obj.entry("metadata").or_insert_with(|| json!({}));
    if !meta.get("labels").map_or(false, Json::is_object) { meta["labels"] = json!({}); }
    meta["labels"][LABEL_DEFINITION_NAME] = json!(owner.name());
    if let Some(reference) = owner_reference(owner) {
        let mut refs: Vec<Json> = meta
            .get("ownerReferences")
            .and_then(Json::as_array)
            .map(|a| a.iter().filter(|r| r.get("controller").and_then(Json::as_bool) != Some(true)).cloned().collect())
            .unwrap_or_default();
        refs.push(reference);
        meta["ownerReferences"] = Json::Array(refs);
    }
    if !meta.get("annotations").map_or(false, Json::is_object) { meta["annotations"] = json!({}); }
    meta["annotations"][ANNOTATION_REVISION] = json!(revision);
}

#[cfg(feature = "jsonschema-validate")]
pub mod validate {
    use super::*;
    use anyhow::{anyhow, Context, Result};
    use jsonschema::{Draft, JSONSchema};

    #[derive(Debug, Clone, Serialize)]
    pub struct ValidationIssue {
        pub path: String,
        pub error: String,
        pub hint: Option<String>,
    }

    /// Check a parameter set against a published schema. Empty on success.
    pub fn validate_parameters(schema: &Json, params: &Json) -> Result<Vec<ValidationIssue>> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| anyhow!("compiling parameter schema: {}", e))?;
        let mut issues = Vec::new();
        if let Err(errors) = compiled.validate(params) {
            for err in errors {
                let error = err.to_string();
                let hint = if error.contains("required property") {
                    Some("missing required parameter".into())
                } else if error.contains("is not of type") {
                    Some("mismatched type".into())
                } else if error.contains("is not one of") {
                    Some("value not in allowed set".into())
                } else {
                    None
                };
                issues.push(ValidationIssue { path: err.instance_path.to_string(), error, hint });
            }
        }
        Ok(issues)
    }

    pub fn validate_yaml(schema: &Json, yaml: &str) -> Result<Vec<ValidationIssue>> {
        let doc: serde_yaml::Value = match serde_yaml::from_str(yaml) {
            Ok(v) => v,
            Err(e) => {
                return Ok(vec![ValidationIssue {
                    path: String::new(),
                    error: format!("YAML parse error: {}", e),
                    hint: Some("check indentation and syntax".into()),
                }])
            }
        };
        let params = serde_json::to_value(doc).context("converting YAML to JSON")?;
        validate_parameters(schema, &params)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn reports_missing_and_mistyped_parameters() {
            let schema = parameter_schema("parameter: {\n\timage: string\n\treplicas: *1 | int\n}\n").unwrap().unwrap();
            assert!(validate_parameters(&schema, &json!({ "image": "nginx" })).unwrap().is_empty());
            let issues = validate_yaml(&schema, "replicas: two\n").unwrap();
            assert_eq!(issues.len(), 2);
            assert!(issues.iter().any(|i| i.path == "/replicas"));
        }
    }
}
