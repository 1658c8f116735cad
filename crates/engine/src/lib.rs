//! Defsmith reconciliation engine.
//!
//! One [`Engine::reconcile`] call takes a single definition through
//! classification, schematic decoding, reference resolution, revision sync and
//! schema publication, then records the result as status conditions on the
//! owner. Every write is conditional on the last observed resourceVersion.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use defsmith_core::{
    Condition, Definition, DefinitionError, DefinitionKind, DefinitionReference, LatestRevision, ObjectKey, Schematic,
    SchematicEngine,
};
use defsmith_revision::{Revision, RevisionError, RevisionManager, SyncAction};
use defsmith_schema::{PublishError, PublishOutcome, SchemaDeriver, SchemaPublisher};
use defsmith_store::{ObjectStore, StoreError};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

mod config;

pub use config::EngineConfig;

pub const CONDITION_SYNCED: &str = "Synced";
pub const CONDITION_SCHEMA_PUBLISHED: &str = "SchemaPublished";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conditional update of {owner} kept conflicting after {attempts} attempts")]
    RevisionConflict { owner: ObjectKey, attempts: u32 },
    #[error("{owner} has no revision {index}")]
    RevisionNotFound { owner: ObjectKey, index: u64 },
    #[error("malformed record {name}: {reason}")]
    Malformed { name: String, reason: String },
}

impl EngineError {
    /// Worth another attempt later without any change to the definition.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RevisionConflict { .. } => true,
            Self::Store(e) => e.is_conflict() || matches!(e, StoreError::Backend(_)),
            _ => false,
        }
    }
}

impl From<RevisionError> for EngineError {
    fn from(e: RevisionError) -> Self {
        match e {
            RevisionError::Store(e) => Self::Store(e),
            RevisionError::Definition(e) => Self::Definition(e),
            RevisionError::Conflict { owner, attempts } => Self::RevisionConflict { owner, attempts },
            RevisionError::Malformed { name, reason } => Self::Malformed { name, reason },
        }
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ReconcileOutcome {
    /// The definition no longer exists.
    Gone,
    Reconciled(ReconcileReport),
}

impl ReconcileOutcome {
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::Gone => None,
            Self::Reconciled(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub owner: ObjectKey,
    pub kind: DefinitionKind,
    pub engine: Option<SchematicEngine>,
    pub reference: Option<DefinitionReference>,
    pub latest_revision: LatestRevision,
    pub revision_action: SyncAction,
    pub schema: SchemaStatus,
    /// Whether the owner's status block had to be rewritten.
    pub status_written: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SchemaStatus {
    Published { outcome: PublishOutcome, artifact: String },
    Skipped,
    Failed { reason: String },
}

enum Pass {
    Done(ReconcileOutcome),
    /// A newer reconcile got ahead; start over from a fresh read.
    Stale,
}

/// Owner state a reconcile pass computed its status from.
struct Observed {
    generation: Option<u64>,
    latest: Option<LatestRevision>,
}

impl Observed {
    fn matches(&self, owner: &Definition) -> bool {
        owner.generation() == self.generation && owner.latest_revision() == self.latest
    }
}

/// Anything that can reconcile a definition by key. The controller loop only
/// depends on this.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, EngineError>;
}

pub struct Engine {
    store: Arc<dyn ObjectStore>,
    revisions: RevisionManager,
    publisher: SchemaPublisher,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn ObjectStore>, config: EngineConfig) -> Self {
        let revisions = RevisionManager::new(store.clone()).with_max_attempts(config.max_conflict_retries);
        let publisher = SchemaPublisher::new(store.clone())
            .with_prefix(config.schema_prefix.clone())
            .with_max_attempts(config.max_conflict_retries);
        Self { store, revisions, publisher, config }
    }

    /// Replace the schema derivation backend.
    pub fn with_deriver(mut self, deriver: Arc<dyn SchemaDeriver>) -> Self {
        self.publisher = self.publisher.with_deriver(deriver);
        self
    }

    pub fn config(&self) -> &EngineConfig { &self.config }
    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }

    /// Reconcile `key`, restarting from a fresh read whenever a concurrent
    /// reconcile of a newer generation wins a write first.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, EngineError> {
        let t0 = Instant::now();
        for attempt in 1..=self.config.max_conflict_retries.max(1) {
            match self.reconcile_once(key).await? {
                Pass::Done(outcome) => {
                    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    return Ok(outcome);
                }
                Pass::Stale => {
                    counter!("reconcile_restart_total", 1u64);
                    debug!(owner = %key, attempt, "reconcile: newer state observed; restarting");
                }
            }
        }
        Err(EngineError::RevisionConflict { owner: key.clone(), attempts: self.config.max_conflict_retries })
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<Pass, EngineError> {
        let t0 = Instant::now();
        let Some(raw) = self.store.get_opt(key).await? else {
            debug!(owner = %key, "reconcile: definition gone");
            return Ok(Pass::Done(ReconcileOutcome::Gone));
        };
        let owner = Definition::from_value(raw)?;
        let decoded = match owner.decode() {
            Ok(d) => d,
            Err(e) => {
                self.report_failure(&owner, &e).await;
                return Err(e.into());
            }
        };

        let sync = self.revisions.sync(owner).await?;

        let (schema, schema_condition) = match self.publisher.publish(&sync.owner, &sync.revision).await {
            Ok(p) if p.outcome == PublishOutcome::Superseded => return Ok(Pass::Stale),
            Ok(p) => match p.artifact {
                Some(artifact) => (
                    SchemaStatus::Published { outcome: p.outcome, artifact: artifact.name.clone() },
                    Condition::new(CONDITION_SCHEMA_PUBLISHED, true, "Published", artifact.name),
                ),
                None => (
                    SchemaStatus::Skipped,
                    Condition::new(CONDITION_SCHEMA_PUBLISHED, true, "NotDerivable", "schematic declares no parameters"),
                ),
            },
            Err(PublishError::Derivation(e)) => {
                warn!(owner = %key, error = %e, "reconcile: schema derivation failed");
                (
                    SchemaStatus::Failed { reason: e.to_string() },
                    Condition::new(CONDITION_SCHEMA_PUBLISHED, false, "SchemaDerivationError", e.to_string()),
                )
            }
            Err(e) => return Err(publish_error(key, e)),
        };

        let synced = Condition::new(CONDITION_SYNCED, true, "Reconciled", format!("latest revision {}", sync.latest.name));
        let schema_ref = match &schema {
            SchemaStatus::Published { artifact, .. } => Some(artifact.clone()),
            _ => None,
        };
        let fence = Observed { generation: sync.owner.generation(), latest: Some(sync.latest.clone()) };
        let status_written = match self.write_status(sync.owner, &[synced, schema_condition], schema_ref, Some(&fence)).await? {
            Some((_, written)) => written,
            None => return Ok(Pass::Stale),
        };

        info!(
            owner = %key,
            revision = %sync.latest.name,
            action = ?sync.action,
            took_ms = %t0.elapsed().as_millis(),
            "reconcile: done"
        );

        Ok(Pass::Done(ReconcileOutcome::Reconciled(ReconcileReport {
            owner: decoded.key,
            kind: decoded.kind,
            engine: decoded.schematic.as_ref().map(Schematic::engine),
            reference: decoded.reference,
            latest_revision: sync.latest,
            revision_action: sync.action,
            schema,
            status_written,
        })))
    }

    /// Merge `conditions` and `schemaRef` into the owner's status. Skips the
    /// write when nothing would change; re-reads and retries on conflict.
    ///
    /// With a `fence`, a re-read owner whose generation or latest revision
    /// moved away from it yields `None` and nothing is written.
    async fn write_status(
        &self,
        mut owner: Definition,
        conditions: &[Condition],
        schema_ref: Option<String>,
        fence: Option<&Observed>,
    ) -> Result<Option<(Definition, bool)>, EngineError> {
        let key = owner.key();
        for _ in 0..self.config.max_conflict_retries {
            let status = merged_status(owner.status(), conditions, schema_ref.as_deref());
            if &status == owner.status() {
                return Ok(Some((owner, false)));
            }
            let rv = owner.resource_version().unwrap_or("").to_string();
            let mut next = owner.clone();
            next.set_status(status);
            match self.store.update_status(next.into_value(), &rv).await {
                Ok(stored) => return Ok(Some((Definition::from_value(stored)?, true))),
                Err(e) if e.is_conflict() => {
                    debug!(owner = %key, "status write raced; re-reading owner");
                    owner = Definition::from_value(self.store.get(&key).await?)?;
                    if fence.map_or(false, |f| !f.matches(&owner)) {
                        info!(owner = %key, "status write superseded by a newer reconcile");
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::RevisionConflict { owner: key, attempts: self.config.max_conflict_retries })
    }

    async fn report_failure(&self, owner: &Definition, err: &DefinitionError) {
        let cond = Condition::new(CONDITION_SYNCED, false, "ReconcileError", err.to_string());
        let schema_ref = owner.status().get("schemaRef").and_then(|v| v.as_str()).map(str::to_string);
        if let Err(e) = self.write_status(owner.clone(), &[cond], schema_ref, None).await {
            warn!(owner = %owner.key(), error = %e, "reconcile: could not record failure condition");
        }
    }

    /// CUE template of the component or trait definition `name`, looked up in
    /// `namespace` first and then in the system namespace.
    pub async fn template_for(&self, capability_type: &str, name: &str, namespace: &str) -> Result<String, EngineError> {
        let kind = DefinitionKind::from_capability_type(capability_type)?;
        if !matches!(kind, DefinitionKind::Component | DefinitionKind::Trait) {
            return Err(DefinitionError::UnsupportedType(capability_type.to_string()).into());
        }
        let def = self.find_definition(kind, name, namespace).await?;
        Ok(def.cue_template()?)
    }

    async fn find_definition(&self, kind: DefinitionKind, name: &str, namespace: &str) -> Result<Definition, EngineError> {
        let key = ObjectKey::new(kind.as_str(), namespace, name);
        if let Some(raw) = self.store.get_opt(&key).await? {
            return Ok(Definition::from_value(raw)?);
        }
        if namespace != self.config.system_namespace {
            let sys = ObjectKey::new(kind.as_str(), &self.config.system_namespace, name);
            if let Some(raw) = self.store.get_opt(&sys).await? {
                return Ok(Definition::from_value(raw)?);
            }
        }
        Err(StoreError::NotFound(key).into())
    }

    /// Frozen schematic of revision `index` of `owner`; `None` for a revision
    /// of a definition that had no schematic at the time.
    pub async fn template_at(&self, owner: &ObjectKey, index: u64) -> Result<Option<Schematic>, EngineError> {
        self.revision(owner, index).await.map(|r| r.schematic)
    }

    pub async fn revision(&self, owner: &ObjectKey, index: u64) -> Result<Revision, EngineError> {
        self.revisions
            .get_revision(owner, index)
            .await?
            .ok_or_else(|| EngineError::RevisionNotFound { owner: owner.clone(), index })
    }

    pub async fn list_revisions(&self, owner: &ObjectKey) -> Result<Vec<Revision>, EngineError> {
        Ok(self.revisions.list_revisions(owner).await?)
    }

    /// Published parameter schema of `owner`, if any.
    pub async fn schema_for(&self, owner: &ObjectKey) -> Result<Option<Json>, EngineError> {
        let Some(raw) = self.store.get_opt(owner).await? else { return Ok(None) };
        let def = Definition::from_value(raw)?;
        self.publisher.fetch(&def).await.map_err(|e| publish_error(owner, e))
    }
}

#[async_trait::async_trait]
impl Reconciler for Engine {
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, EngineError> {
        Engine::reconcile(self, key).await
    }
}

fn publish_error(owner: &ObjectKey, e: PublishError) -> EngineError {
    match e {
        PublishError::Store(e) => EngineError::Store(e),
        PublishError::Definition(e) => EngineError::Definition(e),
        PublishError::Conflict { attempts, .. } => EngineError::RevisionConflict { owner: owner.clone(), attempts },
        PublishError::Malformed { name, reason } => EngineError::Malformed { name, reason },
        PublishError::Derivation(e) => EngineError::Malformed { name: owner.name.clone(), reason: e.to_string() },
    }
}

/// `status` with each of `conditions` replacing the one of the same type and
/// `schemaRef` set or cleared.
fn merged_status(status: &Json, conditions: &[Condition], schema_ref: Option<&str>) -> Json {
    let mut out: Map<String, Json> = status.as_object().cloned().unwrap_or_default();
    let mut list: Vec<Json> = out.get("conditions").and_then(|c| c.as_array()).cloned().unwrap_or_default();
    for cond in conditions {
        let Ok(value) = serde_json::to_value(cond) else { continue };
        match list.iter_mut().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(cond.type_.as_str())) {
            Some(slot) => *slot = value,
            None => list.push(value),
        }
    }
    out.insert("conditions".into(), Json::Array(list));
    match schema_ref {
        Some(r) => {
            out.insert("schemaRef".into(), Json::String(r.to_string()));
        }
        None => {
            out.remove("schemaRef");
        }
    }
    Json::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merged_status_replaces_by_type_and_keeps_others() {
        let status = json!({
            "latestRevision": { "name": "x-v1", "revision": 1 },
            "conditions": [
                { "type": "Ready", "status": "True", "reason": "External" },
                { "type": "Synced", "status": "False", "reason": "ReconcileError", "message": "boom" },
            ],
        });
        let out = merged_status(&status, &[Condition::new("Synced", true, "Reconciled", "ok")], Some("trait-schema-x"));
        assert_eq!(out["latestRevision"]["name"], json!("x-v1"));
        assert_eq!(out["conditions"].as_array().unwrap().len(), 2);
        assert_eq!(out["conditions"][1]["status"], json!("True"));
        assert_eq!(out["schemaRef"], json!("trait-schema-x"));

        let again = merged_status(&out, &[Condition::new("Synced", true, "Reconciled", "ok")], Some("trait-schema-x"));
        assert_eq!(again, out);
        assert!(merged_status(&out, &[], None).get("schemaRef").is_none());
    }

    #[test]
    fn conflicts_are_transient_definition_errors_are_not() {
        let key = ObjectKey::new("TraitDefinition", "default", "x");
        assert!(EngineError::RevisionConflict { owner: key.clone(), attempts: 5 }.is_transient());
        assert!(EngineError::Store(StoreError::Conflict { key, expected: "1".into(), actual: "2".into() }).is_transient());
        assert!(!EngineError::Definition(DefinitionError::NoSupportedSchematic).is_transient());
    }
}
