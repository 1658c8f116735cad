//! Defsmith kubehub: the API server as an [`ObjectStore`], plus list+watch
//! wiring that feeds definition keys into the reconcile loop.

#![forbid(unsafe_code)]

use anyhow::Context;
use async_trait::async_trait;
use defsmith_core::{DefinitionKind, ObjectKey, API_VERSION};
use defsmith_revision::REVISION_KIND;
use defsmith_store::{ObjectStore, StoreError, StoreResult};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::histogram;
use serde_json::Value as Json;
use std::time::Instant;
use tracing::debug;

mod controller;
mod queue;

pub use controller::{run_controller, start_watcher};
pub use queue::KeyCoalescer;

/// API resource for a kind this engine reads or writes.
pub fn api_resource(kind: &str) -> Option<ApiResource> {
    let (group, version) = API_VERSION.split_once('/')?;
    let plural = match kind {
        "ConfigMap" => return Some(ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", kind), "configmaps")),
        REVISION_KIND => "definitionrevisions",
        other => match DefinitionKind::classify(other).ok()? {
            DefinitionKind::Workload => "workloaddefinitions",
            DefinitionKind::Component => "componentdefinitions",
            DefinitionKind::Trait => "traitdefinitions",
            DefinitionKind::Policy => "policydefinitions",
            DefinitionKind::WorkflowStep => "workflowstepdefinitions",
        },
    };
    Some(ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural))
}

pub async fn client() -> anyhow::Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// [`ObjectStore`] over the API server. Conditional writes carry the expected
/// resourceVersion in the object so the server rejects stale writers with 409.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, kind: &str, namespace: &str) -> StoreResult<Api<DynamicObject>> {
        let ar = api_resource(kind).ok_or_else(|| StoreError::Backend(format!("no API resource for kind {}", kind)))?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }
}

fn to_json(obj: &DynamicObject) -> StoreResult<Json> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Backend(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn from_json(raw: Json) -> StoreResult<DynamicObject> {
    serde_json::from_value(raw).map_err(|e| StoreError::Backend(format!("decoding object: {}", e)))
}

fn code_of(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

fn with_version(mut raw: Json, version: &str) -> Json {
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Json::String(version.to_string()));
    }
    raw
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Json> {
        let api = self.api(&key.kind, &key.namespace)?;
        match api.get(&key.name).await {
            Ok(o) => to_json(&o),
            Err(e) if code_of(&e) == Some(404) => Err(StoreError::NotFound(key.clone())),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn create(&self, obj: Json) -> StoreResult<Json> {
        let key = defsmith_store::key_of(&obj)?;
        let api = self.api(&key.kind, &key.namespace)?;
        let t0 = Instant::now();
        let res = api.create(&PostParams::default(), &from_json(obj)?).await;
        histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(o) => to_json(&o),
            Err(e) if code_of(&e) == Some(409) => Err(StoreError::AlreadyExists(key)),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn update(&self, obj: Json, expected_version: &str) -> StoreResult<Json> {
        let key = defsmith_store::key_of(&obj)?;
        let api = self.api(&key.kind, &key.namespace)?;
        let t0 = Instant::now();
        let res = api.replace(&key.name, &PostParams::default(), &from_json(with_version(obj, expected_version))?).await;
        histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(o) => to_json(&o),
            Err(e) if code_of(&e) == Some(409) => {
                debug!(key = %key, expected = expected_version, "replace rejected as stale");
                Err(StoreError::Conflict { key, expected: expected_version.to_string(), actual: String::new() })
            }
            Err(e) if code_of(&e) == Some(404) => Err(StoreError::NotFound(key)),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn update_status(&self, obj: Json, expected_version: &str) -> StoreResult<Json> {
        let key = defsmith_store::key_of(&obj)?;
        let api = self.api(&key.kind, &key.namespace)?;
        let body = serde_json::to_vec(&with_version(obj, expected_version))
            .map_err(|e| StoreError::Backend(format!("serializing status: {}", e)))?;
        let t0 = Instant::now();
        let res = api.replace_status(&key.name, &PostParams::default(), body).await;
        histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(o) => to_json(&o),
            Err(e) if code_of(&e) == Some(409) => {
                Err(StoreError::Conflict { key, expected: expected_version.to_string(), actual: String::new() })
            }
            Err(e) if code_of(&e) == Some(404) => Err(StoreError::NotFound(key)),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn delete(&self, key: &ObjectKey, expected_version: &str) -> StoreResult<()> {
        let api = self.api(&key.kind, &key.namespace)?;
        let dp = DeleteParams {
            preconditions: Some(Preconditions { resource_version: Some(expected_version.to_string()), uid: None }),
            ..DeleteParams::default()
        };
        let t0 = Instant::now();
        let res = api.delete(&key.name, &dp).await;
        histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(_) => Ok(()),
            Err(e) if code_of(&e) == Some(409) => {
                Err(StoreError::Conflict { key: key.clone(), expected: expected_version.to_string(), actual: String::new() })
            }
            Err(e) if code_of(&e) == Some(404) => Err(StoreError::NotFound(key.clone())),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn list(&self, kind: &str, namespace: &str, label: Option<(&str, &str)>) -> StoreResult<Vec<Json>> {
        let api = self.api(kind, namespace)?;
        let mut lp = ListParams::default();
        if let Some((k, v)) = label {
            lp = lp.labels(&format!("{}={}", k, v));
        }
        let list = api.list(&lp).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = list.items.iter().map(to_json).collect::<StoreResult<Vec<_>>>()?;
        out.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        debug!(kind, namespace, count = out.len(), "listed");
        Ok(out)
    }
}

fn name_of(v: &Json) -> &str {
    v.pointer("/metadata/name").and_then(|n| n.as_str()).unwrap_or("")
}
