//! Defsmith store: the record store contract the engine writes through, plus
//! an in-RAM implementation with resourceVersion-conditional updates.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use defsmith_core::ObjectKey;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("already exists: {0}")]
    AlreadyExists(ObjectKey),
    #[error("conflict on {key}: expected resourceVersion {expected}, found {actual}")]
    Conflict { key: ObjectKey, expected: String, actual: String },
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    /// Lost a race against another writer; re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Record store consumed by the engine. Writes other than `create` are
/// conditional on the caller's last observed `metadata.resourceVersion`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Json>;

    async fn get_opt(&self, key: &ObjectKey) -> StoreResult<Option<Json>> {
        match self.get(key).await {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a new record; fails with `AlreadyExists` if the key is taken.
    async fn create(&self, obj: Json) -> StoreResult<Json>;

    /// Replace a record's metadata and body. The stored `status` is kept.
    async fn update(&self, obj: Json, expected_version: &str) -> StoreResult<Json>;

    /// Replace only the `status` block.
    async fn update_status(&self, obj: Json, expected_version: &str) -> StoreResult<Json>;

    /// Remove a record if it is still at `expected_version`.
    async fn delete(&self, key: &ObjectKey, expected_version: &str) -> StoreResult<()>;

    /// Records of `kind` in `namespace`, optionally filtered by one label, sorted by name.
    async fn list(&self, kind: &str, namespace: &str, label: Option<(&str, &str)>) -> StoreResult<Vec<Json>>;
}

pub fn resource_version(obj: &Json) -> &str {
    obj.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str()).unwrap_or("")
}

pub fn key_of(obj: &Json) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Backend("record is missing kind or metadata.name".into()))
}

pub fn has_label(obj: &Json, key: &str, value: &str) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(key))
        .and_then(|v| v.as_str())
        == Some(value)
}

fn meta_mut(obj: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    let root = obj.as_object_mut()?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    meta.as_object_mut()
}

/// In-RAM store. Each record lives in its own `ArcSwap` slot so conditional
/// writes are a compare-and-swap on that slot only.
pub struct MemoryStore {
    objects: RwLock<FxHashMap<ObjectKey, Arc<ArcSwap<Json>>>>,
    version: AtomicU64,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { objects: RwLock::new(FxHashMap::default()), version: AtomicU64::new(0), epoch_tx }
    }

    /// Number of successful writes so far.
    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn len(&self) -> usize { self.objects.read().map(|m| m.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn slot(&self, key: &ObjectKey) -> StoreResult<Option<Arc<ArcSwap<Json>>>> {
        let map = self.objects.read().map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    fn next_version(&self) -> String { (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    fn bump_epoch(&self) { self.epoch_tx.send_modify(|e| *e += 1); }

    /// Shared compare-and-swap path for `update` and `update_status`.
    fn swap_with(
        &self,
        obj: &Json,
        expected: &str,
        merge: impl Fn(&Json, &Json) -> Json,
    ) -> StoreResult<Json> {
        let key = key_of(obj)?;
        let slot = self.slot(&key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let current = slot.load_full();
        let actual = resource_version(&current);
        if actual != expected {
            counter!("store_conflict_total", 1u64);
            return Err(StoreError::Conflict { key, expected: expected.to_string(), actual: actual.to_string() });
        }
        let mut next = merge(&current, obj);
        let rv = self.next_version();
        if let Some(meta) = meta_mut(&mut next) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        let next = Arc::new(next);
        let prev = slot.compare_and_swap(&current, Arc::clone(&next));
        if !Arc::ptr_eq(&*prev, &current) {
            counter!("store_conflict_total", 1u64);
            return Err(StoreError::Conflict {
                key,
                expected: expected.to_string(),
                actual: resource_version(&prev).to_string(),
            });
        }
        self.bump_epoch();
        debug!(key = %key, rv = %resource_version(&next), "store: swapped");
        Ok((*next).clone())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Json> {
        let slot = self.slot(key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let cur = slot.load_full();
        Ok((*cur).clone())
    }

    async fn create(&self, mut obj: Json) -> StoreResult<Json> {
        let key = key_of(&obj)?;
        let rv = self.next_version();
        if let Some(meta) = meta_mut(&mut obj) {
            meta.insert("namespace".into(), Json::String(key.namespace.clone()));
            meta.insert("resourceVersion".into(), Json::String(rv));
            meta.insert("generation".into(), Json::from(1u64));
            meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
            meta.entry("creationTimestamp").or_insert_with(|| Json::String(chrono::Utc::now().to_rfc3339()));
        }
        {
            let mut map = self.objects.write().map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
            if map.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            map.insert(key.clone(), Arc::new(ArcSwap::from_pointee(obj.clone())));
        }
        self.bump_epoch();
        debug!(key = %key, "store: created");
        Ok(obj)
    }

    async fn update(&self, obj: Json, expected_version: &str) -> StoreResult<Json> {
        self.swap_with(&obj, expected_version, |current, incoming| {
            let mut next = incoming.clone();
            let spec_changed = current.get("spec") != incoming.get("spec");
            let cur_meta = current.get("metadata");
            let generation = cur_meta.and_then(|m| m.get("generation")).and_then(|g| g.as_u64()).unwrap_or(1);
            if let Some(root) = next.as_object_mut() {
                match current.get("status") {
                    Some(s) => { root.insert("status".into(), s.clone()); }
                    None => { root.remove("status"); }
                }
            }
            if let Some(meta) = meta_mut(&mut next) {
                for k in ["uid", "creationTimestamp", "namespace"] {
                    if let Some(v) = cur_meta.and_then(|m| m.get(k)) { meta.insert(k.into(), v.clone()); }
                }
                let g = if spec_changed { generation + 1 } else { generation };
                meta.insert("generation".into(), Json::from(g));
            }
            next
        })
    }

    async fn update_status(&self, obj: Json, expected_version: &str) -> StoreResult<Json> {
        self.swap_with(&obj, expected_version, |current, incoming| {
            let mut next = current.clone();
            if let Some(root) = next.as_object_mut() {
                match incoming.get("status") {
                    Some(s) => { root.insert("status".into(), s.clone()); }
                    None => { root.remove("status"); }
                }
            }
            next
        })
    }

    async fn delete(&self, key: &ObjectKey, expected_version: &str) -> StoreResult<()> {
        let mut map = self.objects.write().map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
        let slot = map.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let current = slot.load_full();
        let actual = resource_version(&current);
        if actual != expected_version {
            counter!("store_conflict_total", 1u64);
            return Err(StoreError::Conflict { key: key.clone(), expected: expected_version.to_string(), actual: actual.to_string() });
        }
        // Tombstone the slot so a writer still holding it fails its swap.
        let prev = slot.compare_and_swap(&current, Arc::new(Json::Null));
        if !Arc::ptr_eq(&*prev, &current) {
            counter!("store_conflict_total", 1u64);
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected_version.to_string(),
                actual: resource_version(&prev).to_string(),
            });
        }
        map.remove(key);
        drop(map);
        self.bump_epoch();
        debug!(key = %key, "store: deleted");
        Ok(())
    }

    async fn list(&self, kind: &str, namespace: &str, label: Option<(&str, &str)>) -> StoreResult<Vec<Json>> {
        let slots: Vec<Arc<ArcSwap<Json>>> = {
            let map = self.objects.read().map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
            map.iter()
                .filter(|(k, _)| k.kind == kind && k.namespace == namespace)
                .map(|(_, v)| Arc::clone(v))
                .collect()
        };
        let mut out: Vec<Json> = slots
            .into_iter()
            .map(|s| (*s.load_full()).clone())
            .filter(|o| label.map_or(true, |(k, v)| has_label(o, k, v)))
            .collect();
        out.sort_by(|a, b| {
            let an = a.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
            let bn = b.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
            an.cmp(bn)
        });
        Ok(out)
    }
}
