//! Defsmith core types: definition records, kind classification and schematic decoding.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod convert;
pub mod error;
pub mod kind;
pub mod reference;
pub mod schematic;

pub use error::DefinitionError;
pub use kind::DefinitionKind;
pub use reference::DefinitionReference;
pub use schematic::{CueTemplate, HelmChart, KubeTemplate, Parameter, Schematic, SchematicEngine, TerraformModule};

pub const API_VERSION: &str = "core.oam.dev/v1beta1";
/// Prefix marking user-scoped labels and annotations.
pub const USER_PREFIX: &str = "custom.definition.oam.dev/";
/// Label carried by revisions and schema artifacts naming their owning definition.
pub const LABEL_DEFINITION_NAME: &str = "definition.oam.dev/name";
pub const LABEL_DEFINITION_TYPE: &str = "definition.oam.dev/type";
/// Revision a derived record was produced from, as `<owner>-v<N>`.
pub const ANNOTATION_REVISION: &str = "definition.oam.dev/revision";
pub const DEFAULT_NAMESPACE: &str = "default";

static NULL: Json = Json::Null;

pub mod prelude {
    pub use super::{
        Condition, DecodedDefinition, Definition, DefinitionError, DefinitionKind, DefinitionReference,
        LatestRevision, ObjectKey, Schematic, SchematicEngine,
    };
}

/// Identity of a stored record: `(kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    /// Read the identity of a raw record. Missing namespace means `default`.
    pub fn of(raw: &Json) -> Option<Self> {
        let kind = raw.get("kind")?.as_str()?;
        let meta = raw.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or(DEFAULT_NAMESPACE);
        Some(Self::new(kind, namespace, name))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// `status.latestRevision` of a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestRevision {
    pub name: String,
    pub revision: u64,
    #[serde(default)]
    pub revision_hash: String,
}

/// A status condition as shown to users on the owner record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, ok: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if ok { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_true(&self) -> bool { self.status == "True" }
}

/// A definition record. Wraps the raw object without loss; only the fields
/// the engine needs are read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Definition {
    raw: Json,
}

/// Typed view of a definition produced once at the boundary by [`Definition::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDefinition {
    pub key: ObjectKey,
    pub kind: DefinitionKind,
    pub schematic: Option<Schematic>,
    pub reference: Option<DefinitionReference>,
}

impl Definition {
    pub fn from_value(raw: Json) -> Result<Self, DefinitionError> {
        if !raw.is_object() {
            return Err(DefinitionError::MalformedObject("record is not an object".into()));
        }
        if raw.get("kind").and_then(|v| v.as_str()).is_none() {
            return Err(DefinitionError::MalformedObject("record has no kind".into()));
        }
        let name = raw.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
        if name.is_empty() {
            return Err(DefinitionError::MalformedObject("record has no metadata.name".into()));
        }
        Ok(Self { raw })
    }

    pub fn as_value(&self) -> &Json { &self.raw }
    pub fn into_value(self) -> Json { self.raw }

    pub fn kind_str(&self) -> &str {
        self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or("")
    }

    /// Classified kind; unrecognized kinds fail closed.
    pub fn kind(&self) -> Result<DefinitionKind, DefinitionError> {
        DefinitionKind::classify(self.kind_str())
            .map_err(|_| DefinitionError::NotADefinition { kind: self.kind_str().to_string() })
    }

    fn metadata(&self) -> &Json { self.raw.get("metadata").unwrap_or(&NULL) }

    pub fn name(&self) -> &str {
        self.metadata().get("name").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata().get("namespace").and_then(|v| v.as_str()).unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.kind_str(), self.namespace(), self.name()) }

    pub fn generation(&self) -> Option<u64> { self.metadata().get("generation").and_then(Json::as_u64) }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().get("resourceVersion").and_then(|v| v.as_str())
    }

    pub fn labels(&self) -> BTreeMap<String, String> { string_map(self.metadata().get("labels")) }
    pub fn annotations(&self) -> BTreeMap<String, String> { string_map(self.metadata().get("annotations")) }

    pub fn user_labels(&self) -> BTreeMap<String, String> { filter_prefix(self.labels(), USER_PREFIX) }
    pub fn user_annotations(&self) -> BTreeMap<String, String> { filter_prefix(self.annotations(), USER_PREFIX) }

    pub fn spec(&self) -> &Json { self.raw.get("spec").unwrap_or(&NULL) }
    pub fn status(&self) -> &Json { self.raw.get("status").unwrap_or(&NULL) }

    /// Replace the whole `status` block.
    pub fn set_status(&mut self, status: Json) {
        if let Some(obj) = self.raw.as_object_mut() {
            obj.insert("status".into(), status);
        }
    }

    pub fn latest_revision(&self) -> Option<LatestRevision> {
        self.status().get("latestRevision").and_then(|v| LatestRevision::deserialize(v).ok())
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.status()
            .get("conditions")
            .and_then(|v| Vec::<Condition>::deserialize(v).ok())
            .unwrap_or_default()
    }

    pub fn is_workload_definition(&self) -> bool { self.kind_str() == "WorkloadDefinition" }
    pub fn is_component_definition(&self) -> bool { self.kind_str() == "ComponentDefinition" }
    pub fn is_trait_definition(&self) -> bool { self.kind_str() == "TraitDefinition" }
    pub fn is_policy_definition(&self) -> bool { self.kind_str() == "PolicyDefinition" }
    pub fn is_workflow_step_definition(&self) -> bool { self.kind_str() == "WorkflowStepDefinition" }

    /// Decode kind, schematic and reference in one pass.
    pub fn decode(&self) -> Result<DecodedDefinition, DefinitionError> {
        let kind = self.kind()?;
        let spec = self.spec();
        let schematic = schematic::decode_schematic(spec)?;
        let reference = reference::resolve_optional(spec)?;
        Ok(DecodedDefinition { key: self.key(), kind, schematic, reference })
    }

    /// The CUE template, or an error naming this definition when it has none.
    pub fn cue_template(&self) -> Result<String, DefinitionError> {
        let kind = self.kind()?;
        match schematic::extract(self.spec())? {
            Some(Schematic::Cue(c)) => Ok(c.template),
            _ => Err(DefinitionError::MissingSchematic {
                kind: kind.as_str().to_string(),
                namespace: self.namespace().to_string(),
                name: self.name().to_string(),
                engine: SchematicEngine::Cue,
            }),
        }
    }
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Keep entries whose key starts with `prefix` and is strictly longer than it.
pub fn filter_prefix(m: BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    m.into_iter().filter(|(k, _)| k.len() > prefix.len() && k.starts_with(prefix)).collect()
}
