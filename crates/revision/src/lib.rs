//! Defsmith revisions: immutable `<owner>-v<N>` snapshots of a definition's
//! schematic plus the owner's movable `status.latestRevision` pointer.
//!
//! A revision record is only ever created, never rewritten. Index assignment
//! rides on `create` (a taken name means another writer got there first) and
//! the pointer advance is a status write conditional on the owner's
//! resourceVersion. Losing either race re-reads the owner and starts over.

#![forbid(unsafe_code)]

use std::sync::Arc;

use defsmith_core::{
    Definition, DefinitionError, DefinitionKind, LatestRevision, ObjectKey, Schematic, ANNOTATION_REVISION, API_VERSION,
    LABEL_DEFINITION_NAME, LABEL_DEFINITION_TYPE,
};
use defsmith_store::{ObjectStore, StoreError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info};

pub const REVISION_KIND: &str = "DefinitionRevision";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub fn revision_name(owner: &str, index: u64) -> String {
    format!("{}-v{}", owner, index)
}

/// Index of a `<owner>-v<N>` revision name.
pub fn revision_index(name: &str) -> Option<u64> {
    name.rsplit_once("-v").and_then(|(_, n)| n.parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("revision update for {owner} kept conflicting after {attempts} attempts")]
    Conflict { owner: ObjectKey, attempts: u32 },
    #[error("malformed revision {name}: {reason}")]
    Malformed { name: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionSpec {
    revision: u64,
    #[serde(default)]
    revision_hash: String,
    #[serde(default)]
    definition_type: String,
}

/// `definitionType` and the spec field holding the frozen definition, per
/// owner kind. Workload definitions are frozen in their component form.
fn definition_slot(kind: DefinitionKind) -> (&'static str, &'static str) {
    match kind {
        DefinitionKind::Workload | DefinitionKind::Component => ("Component", "componentDefinition"),
        DefinitionKind::Trait => ("Trait", "traitDefinition"),
        DefinitionKind::Policy => ("Policy", "policyDefinition"),
        DefinitionKind::WorkflowStep => ("WorkflowStep", "workflowStepDefinition"),
    }
}

fn kind_of_definition_type(ty: &str) -> Option<DefinitionKind> {
    DefinitionKind::ALL.iter().copied().find(|k| k != &DefinitionKind::Workload && definition_slot(*k).0 == ty)
}

/// A frozen snapshot of one owner's schematic.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub name: String,
    pub owner_name: String,
    pub owner_namespace: String,
    pub owner_kind: DefinitionKind,
    pub index: u64,
    pub revision_hash: String,
    pub schematic: Option<Schematic>,
    /// The owner as frozen into the record: `apiVersion`, `kind` and `spec`.
    pub definition: Json,
    pub created_at: String,
}

fn schematic_hash(s: &Option<Schematic>) -> String {
    s.as_ref().map(|s| s.fingerprint()).unwrap_or_default()
}

/// Owner spec with its schematic pinned to `schematic`.
fn frozen_definition(owner: &Definition, kind: DefinitionKind, schematic: &Option<Schematic>) -> Json {
    let (spec, frozen_kind) = match kind {
        DefinitionKind::Workload => match defsmith_core::convert::workload_to_component(owner) {
            Ok(c) => (c.spec().clone(), DefinitionKind::Component),
            Err(_) => (json!({}), DefinitionKind::Component),
        },
        _ => (owner.spec().clone(), kind),
    };
    let mut spec = match spec {
        Json::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    match schematic {
        Some(s) => { spec.insert("schematic".into(), s.to_value()); }
        None => { spec.remove("schematic"); }
    }
    json!({ "apiVersion": API_VERSION, "kind": frozen_kind.as_str(), "spec": Json::Object(spec) })
}

impl Revision {
    pub fn new(owner: &Definition, owner_kind: DefinitionKind, index: u64, schematic: Option<Schematic>) -> Self {
        Self {
            name: revision_name(owner.name(), index),
            owner_name: owner.name().to_string(),
            owner_namespace: owner.namespace().to_string(),
            owner_kind,
            index,
            revision_hash: schematic_hash(&schematic),
            definition: frozen_definition(owner, owner_kind, &schematic),
            schematic,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(REVISION_KIND, &self.owner_namespace, &self.name) }

    pub fn latest(&self) -> LatestRevision {
        LatestRevision { name: self.name.clone(), revision: self.index, revision_hash: self.revision_hash.clone() }
    }

    /// The stored `DefinitionRevision`. Only fields of the published
    /// `definitionrevisions` schema are written to `spec`; owner identity
    /// travels in labels.
    pub fn to_record(&self) -> Json {
        let (definition_type, field) = definition_slot(self.owner_kind);
        json!({
            "apiVersion": API_VERSION,
            "kind": REVISION_KIND,
            "metadata": {
                "name": self.name,
                "namespace": self.owner_namespace,
                "creationTimestamp": self.created_at,
                "labels": {
                    LABEL_DEFINITION_NAME: self.owner_name,
                    LABEL_DEFINITION_TYPE: self.owner_kind.capability_type(),
                },
            },
            "spec": {
                "revision": self.index,
                "revisionHash": self.revision_hash,
                "definitionType": definition_type,
                field: self.definition,
            },
        })
    }

    pub fn from_record(raw: &Json) -> Result<Self, RevisionError> {
        let name = raw.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let malformed = |reason: String| RevisionError::Malformed { name: name.clone(), reason };
        let meta = raw.get("metadata").ok_or_else(|| malformed("missing metadata".into()))?;
        let label = |k: &str| meta.get("labels").and_then(|l| l.get(k)).and_then(|v| v.as_str());
        let owner_name = label(LABEL_DEFINITION_NAME)
            .ok_or_else(|| malformed(format!("missing {} label", LABEL_DEFINITION_NAME)))?
            .to_string();
        let owner_namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or(defsmith_core::DEFAULT_NAMESPACE).to_string();
        let raw_spec = raw.get("spec").ok_or_else(|| malformed("missing spec".into()))?;
        let spec = RevisionSpec::deserialize(raw_spec).map_err(|e| malformed(e.to_string()))?;
        let owner_kind = label(LABEL_DEFINITION_TYPE)
            .and_then(|t| DefinitionKind::from_capability_type(t).ok())
            .or_else(|| kind_of_definition_type(&spec.definition_type))
            .ok_or_else(|| malformed(format!("unknown definitionType `{}`", spec.definition_type)))?;
        let (_, field) = definition_slot(owner_kind);
        let definition = raw_spec.get(field).cloned().unwrap_or_else(|| json!({}));
        let schematic = defsmith_core::schematic::extract(definition.get("spec").unwrap_or(&Json::Null))
            .map_err(|e| malformed(e.to_string()))?;
        let created_at = meta.get("creationTimestamp").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Ok(Self {
            name: name.clone(),
            owner_name,
            owner_namespace,
            owner_kind,
            index: spec.revision,
            revision_hash: spec.revision_hash,
            schematic,
            definition,
            created_at,
        })
    }

    /// Rebuild a definition of the owner's kind carrying this revision's schematic.
    pub fn to_definition(&self) -> Result<Definition, DefinitionError> {
        let mut spec = serde_json::Map::new();
        if let Some(s) = &self.schematic {
            spec.insert("schematic".into(), s.to_value());
        }
        Definition::from_value(json!({
            "apiVersion": API_VERSION,
            "kind": self.owner_kind.as_str(),
            "metadata": {
                "name": self.owner_name,
                "namespace": self.owner_namespace,
                "annotations": { ANNOTATION_REVISION: self.name },
            },
            "spec": Json::Object(spec),
        }))
    }
}

/// How the latest pointer was brought in line with the owner's schematic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Latest revision already matched; nothing written.
    Unchanged,
    /// A new revision was created and the pointer advanced to it.
    Created,
    /// A matching revision existed without a pointer to it (crash or concurrent
    /// winner); only the pointer was advanced.
    Adopted,
}

#[derive(Debug, Clone)]
pub struct RevisionSync {
    pub action: SyncAction,
    pub latest: LatestRevision,
    pub revision: Revision,
    /// Owner as last read or written; carries the current resourceVersion.
    pub owner: Definition,
}

pub struct RevisionManager {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
}

impl RevisionManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Converge the owner's revision history with its current schematic.
    ///
    /// `observed` is used for the first attempt; after a lost race the owner
    /// is re-read from the store.
    pub async fn sync(&self, observed: Definition) -> Result<RevisionSync, RevisionError> {
        let key = observed.key();
        let mut owner = observed;
        for attempt in 1..=self.max_attempts {
            match self.try_sync(&owner).await {
                Ok(done) => return Ok(done),
                Err(RevisionError::Store(e)) if e.is_conflict() => {
                    counter!("revision_conflict_total", 1u64);
                    debug!(owner = %key, attempt, error = %e, "revision: lost race; re-reading owner");
                    owner = Definition::from_value(self.store.get(&key).await?)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RevisionError::Conflict { owner: key, attempts: self.max_attempts })
    }

    async fn try_sync(&self, owner: &Definition) -> Result<RevisionSync, RevisionError> {
        let kind = owner.kind()?;
        let desired = owner.decode()?.schematic;
        let pointer = owner.latest_revision();

        if let Some(p) = &pointer {
            if let Slot::Owned(rev) = self.slot(owner, p.revision).await? {
                if rev.schematic == desired {
                    return Ok(RevisionSync { action: SyncAction::Unchanged, latest: p.clone(), revision: rev, owner: owner.clone() });
                }
            }
        }

        // Without a pointer, start at the newest stored revision; older ones
        // are never adopted.
        let mut index = match &pointer {
            Some(p) => p.revision + 1,
            None => self.list_revisions(&owner.key()).await?.last().map(|r| r.index).unwrap_or(1),
        };
        let (revision, action) = loop {
            match self.slot(owner, index).await? {
                Slot::Owned(existing) if existing.schematic == desired => break (existing, SyncAction::Adopted),
                Slot::Owned(_) | Slot::Foreign => index += 1,
                Slot::Free => {
                    let rev = Revision::new(owner, kind, index, desired.clone());
                    self.store.create(rev.to_record()).await?;
                    counter!("revision_created_total", 1u64);
                    info!(owner = %owner.key(), revision = %rev.name, hash = %rev.revision_hash, "revision: created");
                    break (rev, SyncAction::Created);
                }
            }
        };

        let latest = revision.latest();
        let mut status = match owner.status() {
            Json::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };
        status.insert("latestRevision".into(), serde_json::to_value(&latest).unwrap_or_default());
        let mut next = owner.clone();
        next.set_status(Json::Object(status));
        let rv = owner.resource_version().unwrap_or("");
        let stored = self.store.update_status(next.into_value(), rv).await?;
        info!(owner = %owner.key(), latest = %latest.name, ?action, "revision: latest pointer advanced");
        Ok(RevisionSync { action, latest, revision, owner: Definition::from_value(stored)? })
    }

    /// Revision `<index>` of the owner identified by `owner`, if stored.
    pub async fn get_revision(&self, owner: &ObjectKey, index: u64) -> Result<Option<Revision>, RevisionError> {
        let key = ObjectKey::new(REVISION_KIND, &owner.namespace, revision_name(&owner.name, index));
        match self.store.get_opt(&key).await? {
            Some(raw) => {
                let rev = Revision::from_record(&raw)?;
                Ok(Some(rev).filter(|r| r.owner_kind.as_str() == owner.kind && r.owner_name == owner.name))
            }
            None => Ok(None),
        }
    }

    /// All revisions of `owner`, ascending by index.
    pub async fn list_revisions(&self, owner: &ObjectKey) -> Result<Vec<Revision>, RevisionError> {
        let raws = self.store.list(REVISION_KIND, &owner.namespace, Some((LABEL_DEFINITION_NAME, &owner.name))).await?;
        let mut out = Vec::with_capacity(raws.len());
        for raw in raws.iter() {
            let rev = Revision::from_record(raw)?;
            if rev.owner_kind.as_str() == owner.kind {
                out.push(rev);
            }
        }
        out.sort_by_key(|r| r.index);
        Ok(out)
    }

    async fn slot(&self, owner: &Definition, index: u64) -> Result<Slot, RevisionError> {
        let key = ObjectKey::new(REVISION_KIND, owner.namespace(), revision_name(owner.name(), index));
        let Some(raw) = self.store.get_opt(&key).await? else { return Ok(Slot::Free) };
        let rev = Revision::from_record(&raw)?;
        // A same-named definition of another kind shares the `<name>-v<N>` namespace.
        if rev.owner_kind.as_str() != owner.kind_str() || rev.owner_name != owner.name() {
            return Ok(Slot::Foreign);
        }
        Ok(Slot::Owned(rev))
    }
}

enum Slot {
    Free,
    Owned(Revision),
    Foreign,
}
