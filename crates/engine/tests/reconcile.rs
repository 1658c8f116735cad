use std::sync::Arc;

use defsmith_core::{Definition, ObjectKey, Schematic, LABEL_DEFINITION_NAME};
use defsmith_engine::{Engine, EngineConfig, EngineError, ReconcileOutcome, ReconcileReport, SchemaStatus};
use defsmith_revision::{SyncAction, REVISION_KIND};
use defsmith_schema::{PublishOutcome, SchemaDerivationError, SchemaDeriver, CONFIGMAP_KIND, SCHEMA_DATA_KEY};
use defsmith_store::{resource_version, MemoryStore, ObjectStore};
use serde_json::{json, Value as Json};

const TEMPLATE_V1: &str = r#"
output: {
	apiVersion: "example.com/v1"
	kind:       "Foo"
	spec: key: parameter.key1
}
parameter: {
	key1: string
}
"#;

const TEMPLATE_V2: &str = r#"
output: {
	apiVersion: "example.com/v1"
	kind:       "Foo"
	spec: {
		key:  parameter.key1
		key2: parameter.key2
	}
}
parameter: {
	key1: string
	key2?: int
}
"#;

fn trait_def(name: &str, ns: &str, schematic: Json) -> Json {
    json!({
        "apiVersion": "core.oam.dev/v1beta1",
        "kind": "TraitDefinition",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "appliesToWorkloads": ["deployments.apps"], "schematic": schematic },
    })
}

fn cue(template: &str) -> Json {
    json!({ "cue": { "template": template } })
}

async fn setup(objs: Vec<Json>) -> (Arc<MemoryStore>, Engine) {
    let store = Arc::new(MemoryStore::new());
    for o in objs {
        store.create(o).await.unwrap();
    }
    let engine = Engine::new(store.clone(), EngineConfig::default());
    (store, engine)
}

fn report(out: ReconcileOutcome) -> ReconcileReport {
    match out {
        ReconcileOutcome::Reconciled(r) => r,
        ReconcileOutcome::Gone => panic!("definition unexpectedly gone"),
    }
}

async fn owner(store: &MemoryStore, key: &ObjectKey) -> Definition {
    Definition::from_value(store.get(key).await.unwrap()).unwrap()
}

#[tokio::test]
async fn refresh_publishes_labeled_schema_artifact() {
    let (store, engine) = setup(vec![trait_def("test-refresh", "default", cue(TEMPLATE_V1))]).await;
    let key = ObjectKey::new("TraitDefinition", "default", "test-refresh");

    let r = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(r.revision_action, SyncAction::Created);
    assert_eq!(r.schema, SchemaStatus::Published { outcome: PublishOutcome::Created, artifact: "trait-schema-test-refresh".into() });

    let cm = store.get(&ObjectKey::new(CONFIGMAP_KIND, "default", "trait-schema-test-refresh")).await.unwrap();
    assert_eq!(cm["metadata"]["labels"][LABEL_DEFINITION_NAME], json!("test-refresh"));
    assert!(!cm["data"][SCHEMA_DATA_KEY].as_str().unwrap().is_empty());

    let def = owner(&store, &key).await;
    assert_eq!(def.status()["schemaRef"], json!("trait-schema-test-refresh"));
    let synced = def.conditions().into_iter().find(|c| c.type_ == "Synced").unwrap();
    assert!(synced.is_true());
    assert_eq!(def.latest_revision().unwrap().name, "test-refresh-v1");
}

#[tokio::test]
async fn template_edit_adds_revision_and_keeps_history() {
    let (store, engine) = setup(vec![trait_def("test-update-traitdef", "test-revision", cue(TEMPLATE_V1))]).await;
    let key = ObjectKey::new("TraitDefinition", "test-revision", "test-update-traitdef");
    engine.reconcile(&key).await.unwrap();
    assert_eq!(owner(&store, &key).await.latest_revision().unwrap().name, "test-update-traitdef-v1");

    let cur = store.get(&key).await.unwrap();
    let mut next = cur.clone();
    next["spec"]["schematic"]["cue"]["template"] = json!(TEMPLATE_V2);
    store.update(next, resource_version(&cur)).await.unwrap();

    let r = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(r.revision_action, SyncAction::Created);
    assert_eq!(r.latest_revision.name, "test-update-traitdef-v2");
    assert_eq!(r.latest_revision.revision, 2);
    assert!(matches!(r.schema, SchemaStatus::Published { outcome: PublishOutcome::Updated, .. }));

    let old = engine.template_at(&key, 1).await.unwrap().unwrap();
    assert_eq!(old.cue_template(), Some(TEMPLATE_V1));
    let new = engine.template_at(&key, 2).await.unwrap().unwrap();
    assert_eq!(new.cue_template(), Some(TEMPLATE_V2));
    assert!(matches!(engine.template_at(&key, 3).await, Err(EngineError::RevisionNotFound { index: 3, .. })));

    let names: Vec<String> = engine.list_revisions(&key).await.unwrap().into_iter().map(|r| r.name).collect();
    assert_eq!(names, ["test-update-traitdef-v1", "test-update-traitdef-v2"]);

    let schema = engine.schema_for(&key).await.unwrap().unwrap();
    assert_eq!(schema["properties"]["key2"]["type"], json!("integer"));
}

#[tokio::test]
async fn second_reconcile_is_a_noop() {
    let (store, engine) = setup(vec![trait_def("idem", "default", cue(TEMPLATE_V1))]).await;
    let key = ObjectKey::new("TraitDefinition", "default", "idem");
    let first = report(engine.reconcile(&key).await.unwrap());
    assert!(first.status_written);

    let epoch = store.epoch();
    let second = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(second.revision_action, SyncAction::Unchanged);
    assert!(matches!(second.schema, SchemaStatus::Published { outcome: PublishOutcome::Unchanged, .. }));
    assert!(!second.status_written);
    assert_eq!(store.epoch(), epoch);
    assert_eq!(store.list(REVISION_KIND, "default", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn multiple_engines_are_rejected_and_reported() {
    let schematic = json!({
        "cue": { "template": TEMPLATE_V1 },
        "helm": { "chart": "podinfo", "repository": "https://stefanprodan.github.io/podinfo" },
    });
    let (store, engine) = setup(vec![trait_def("both", "default", schematic)]).await;
    let key = ObjectKey::new("TraitDefinition", "default", "both");

    let err = engine.reconcile(&key).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("cue") && msg.contains("helm"), "{msg}");
    assert!(!err.is_transient());

    let def = owner(&store, &key).await;
    let synced = def.conditions().into_iter().find(|c| c.type_ == "Synced").unwrap();
    assert!(!synced.is_true());
    assert_eq!(synced.reason, "ReconcileError");
    assert!(def.latest_revision().is_none());
    assert!(store.list(REVISION_KIND, "default", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_definition_is_gone() {
    let (_, engine) = setup(vec![]).await;
    let out = engine.reconcile(&ObjectKey::new("TraitDefinition", "default", "nope")).await.unwrap();
    assert!(matches!(out, ReconcileOutcome::Gone));
}

#[tokio::test]
async fn helm_definitions_get_revisions_but_no_schema() {
    let comp = json!({
        "apiVersion": "core.oam.dev/v1beta1",
        "kind": "ComponentDefinition",
        "metadata": { "name": "podinfo", "namespace": "default" },
        "spec": {
            "workload": { "definition": { "apiVersion": "apps/v1", "kind": "Deployment" } },
            "schematic": { "helm": { "chart": "podinfo", "repository": "https://stefanprodan.github.io/podinfo", "version": "5.1.4" } },
        },
    });
    let (store, engine) = setup(vec![comp]).await;
    let key = ObjectKey::new("ComponentDefinition", "default", "podinfo");
    let r = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(r.schema, SchemaStatus::Skipped);
    assert_eq!(r.latest_revision.name, "podinfo-v1");
    assert!(store.list(CONFIGMAP_KIND, "default", None).await.unwrap().is_empty());
    assert!(owner(&store, &key).await.status().get("schemaRef").is_none());
}

#[tokio::test]
async fn schema_failure_does_not_block_revisions() {
    let (store, engine) = setup(vec![trait_def("broken", "default", cue("parameter: {\n\tkey1: string\n"))]).await;
    let key = ObjectKey::new("TraitDefinition", "default", "broken");
    let r = report(engine.reconcile(&key).await.unwrap());
    assert!(matches!(r.schema, SchemaStatus::Failed { .. }));
    assert_eq!(r.latest_revision.name, "broken-v1");

    let def = owner(&store, &key).await;
    let conds = def.conditions();
    let synced = conds.iter().find(|c| c.type_ == "Synced").unwrap();
    let published = conds.iter().find(|c| c.type_ == "SchemaPublished").unwrap();
    assert!(synced.is_true());
    assert!(!published.is_true());
    assert_eq!(published.reason, "SchemaDerivationError");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciles_agree_on_one_revision() {
    let store = Arc::new(MemoryStore::new());
    store.create(trait_def("racy", "default", cue(TEMPLATE_V1))).await.unwrap();
    let cfg = EngineConfig { max_conflict_retries: 10, ..EngineConfig::default() };
    let engine = Arc::new(Engine::new(store.clone(), cfg));
    let key = ObjectKey::new("TraitDefinition", "default", "racy");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move { engine.reconcile(&key).await }));
    }
    for t in tasks {
        let r = report(t.await.unwrap().unwrap());
        assert_eq!(r.latest_revision.name, "racy-v1");
    }
    assert_eq!(engine.list_revisions(&key).await.unwrap().len(), 1);
    assert_eq!(store.list(CONFIGMAP_KIND, "default", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn template_lookup_by_capability_type() {
    let comp = json!({
        "apiVersion": "core.oam.dev/v1beta1",
        "kind": "ComponentDefinition",
        "metadata": { "name": "worker", "namespace": "vela-system" },
        "spec": { "schematic": { "cue": { "template": TEMPLATE_V1 } } },
    });
    let ref_only = json!({
        "apiVersion": "core.oam.dev/v1beta1",
        "kind": "TraitDefinition",
        "metadata": { "name": "plain", "namespace": "default" },
        "spec": { "definitionRef": { "name": "plains.example.com" } },
    });
    let (_, engine) = setup(vec![comp, ref_only]).await;

    assert_eq!(engine.template_for("component", "worker", "my-app").await.unwrap(), TEMPLATE_V1);
    let err = engine.template_for("trait", "plain", "default").await.unwrap_err();
    assert_eq!(err.to_string(), "TraitDefinition default/plain does not have a CUE template");
    let err = engine.template_for("policy", "worker", "default").await.unwrap_err();
    assert!(err.to_string().contains("unsupported definition type"), "{err}");
    assert!(engine.template_for("trait", "absent", "default").await.is_err());
}

struct FixedDeriver;

impl SchemaDeriver for FixedDeriver {
    fn derive(&self, schematic: &Schematic) -> Result<Option<Json>, SchemaDerivationError> {
        match schematic {
            Schematic::Helm(_) => Ok(Some(json!({ "type": "object", "properties": { "image": { "type": "string" } } }))),
            other => Err(SchemaDerivationError::Unsupported(other.engine())),
        }
    }
}

#[tokio::test]
async fn external_deriver_can_be_plugged_in() {
    let helm = json!({
        "apiVersion": "core.oam.dev/v1beta1",
        "kind": "ComponentDefinition",
        "metadata": { "name": "chart", "namespace": "default" },
        "spec": { "schematic": { "helm": { "chart": "podinfo" } } },
    });
    let (store, _) = setup(vec![helm]).await;
    let engine = Engine::new(store.clone(), EngineConfig::default()).with_deriver(Arc::new(FixedDeriver));
    let key = ObjectKey::new("ComponentDefinition", "default", "chart");
    let r = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(r.schema, SchemaStatus::Published { outcome: PublishOutcome::Created, artifact: "component-schema-chart".into() });
}

/// Runs a complete reconcile of an edited owner the first time the schema
/// artifact is read, so the outer reconcile resumes with stale state.
struct EditDuringPublish {
    inner: Arc<MemoryStore>,
    owner: ObjectKey,
    artifact: ObjectKey,
    edited: Json,
    fired: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl ObjectStore for EditDuringPublish {
    async fn get(&self, key: &ObjectKey) -> defsmith_store::StoreResult<Json> {
        if key == &self.artifact && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
            let mut current = self.inner.get(&self.owner).await?;
            let rv = resource_version(&current).to_string();
            current["spec"]["schematic"] = self.edited.clone();
            self.inner.update(current, &rv).await?;
            let newer = Engine::new(self.inner.clone(), EngineConfig::default());
            newer.reconcile(&self.owner).await.map_err(|e| defsmith_store::StoreError::Backend(e.to_string()))?;
        }
        self.inner.get(key).await
    }
    async fn create(&self, obj: Json) -> defsmith_store::StoreResult<Json> { self.inner.create(obj).await }
    async fn update(&self, obj: Json, rv: &str) -> defsmith_store::StoreResult<Json> { self.inner.update(obj, rv).await }
    async fn update_status(&self, obj: Json, rv: &str) -> defsmith_store::StoreResult<Json> {
        self.inner.update_status(obj, rv).await
    }
    async fn delete(&self, key: &ObjectKey, rv: &str) -> defsmith_store::StoreResult<()> { self.inner.delete(key, rv).await }
    async fn list(&self, kind: &str, ns: &str, label: Option<(&str, &str)>) -> defsmith_store::StoreResult<Vec<Json>> {
        self.inner.list(kind, ns, label).await
    }
}

#[tokio::test]
async fn stale_reconcile_does_not_overwrite_newer_schema() {
    let inner = Arc::new(MemoryStore::new());
    inner.create(trait_def("interleaved", "default", cue(TEMPLATE_V1))).await.unwrap();
    let key = ObjectKey::new("TraitDefinition", "default", "interleaved");
    let artifact = ObjectKey::new(CONFIGMAP_KIND, "default", "trait-schema-interleaved");
    let store = Arc::new(EditDuringPublish {
        inner: inner.clone(),
        owner: key.clone(),
        artifact: artifact.clone(),
        edited: cue(TEMPLATE_V2),
        fired: std::sync::atomic::AtomicBool::new(false),
    });
    let engine = Engine::new(store, EngineConfig::default());

    let r = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(r.latest_revision.name, "interleaved-v2");

    let def = owner(&inner, &key).await;
    assert_eq!(def.latest_revision().unwrap().name, "interleaved-v2");
    assert_eq!(def.status()["schemaRef"], json!("trait-schema-interleaved"));
    let cm = inner.get(&artifact).await.unwrap();
    assert_eq!(cm["metadata"]["annotations"]["definition.oam.dev/revision"], json!("interleaved-v2"));
    let schema: Json = serde_json::from_str(cm["data"][SCHEMA_DATA_KEY].as_str().unwrap()).unwrap();
    assert!(schema["properties"].get("key2").is_some(), "{schema}");
    assert_eq!(engine.list_revisions(&key).await.unwrap().len(), 2);
}

#[tokio::test]
async fn dropping_the_parameter_section_removes_the_schema() {
    let (store, engine) =
        setup(vec![trait_def("shrinking", "default", cue("output: {}\nparameter: {\n\told: string\n}\n"))]).await;
    let key = ObjectKey::new("TraitDefinition", "default", "shrinking");
    report(engine.reconcile(&key).await.unwrap());
    assert!(engine.schema_for(&key).await.unwrap().is_some());
    assert_eq!(owner(&store, &key).await.status()["schemaRef"], json!("trait-schema-shrinking"));

    let mut current = store.get(&key).await.unwrap();
    let rv = resource_version(&current).to_string();
    current["spec"]["schematic"] = cue("output: {}\n");
    store.update(current, &rv).await.unwrap();

    let r = report(engine.reconcile(&key).await.unwrap());
    assert_eq!(r.latest_revision.name, "shrinking-v2");
    assert_eq!(r.schema, SchemaStatus::Skipped);
    assert!(store.get_opt(&ObjectKey::new(CONFIGMAP_KIND, "default", "trait-schema-shrinking")).await.unwrap().is_none());
    assert!(engine.schema_for(&key).await.unwrap().is_none());
    assert!(owner(&store, &key).await.status().get("schemaRef").map_or(true, Json::is_null));
}
