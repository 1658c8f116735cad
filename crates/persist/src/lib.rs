//! Defsmith persistence: SQLite-backed `ObjectStore` for local, durable operation.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use defsmith_core::ObjectKey;
use defsmith_store::{key_of, has_label, ObjectStore, StoreError, StoreResult};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use serde_json::Value as Json;

/// SQLite-backed store. Simple, synchronous; the CLI isn't latency sensitive here.
///
/// `resourceVersion` is the row's `rv` column and is bumped on every write;
/// conditional writes are a single `UPDATE ... WHERE rv = ?`.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("DEFSMITH_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                kind      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                rv        INTEGER NOT NULL,
                body      TEXT NOT NULL,
                PRIMARY KEY (kind, namespace, name)
            )",
            [],
        )
        .context("creating objects table")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> StoreResult<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError { StoreError::Backend(e.to_string()) }

fn decode(body: &str, rv: i64) -> StoreResult<Json> {
    let mut v: Json = serde_json::from_str(body).map_err(backend)?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
    }
    Ok(v)
}

fn parse_rv(key: &ObjectKey, expected: &str) -> StoreResult<i64> {
    expected.parse::<i64>().map_err(|_| StoreError::Conflict {
        key: key.clone(),
        expected: expected.to_string(),
        actual: "?".into(),
    })
}

fn read_row(db: &rusqlite::Connection, key: &ObjectKey) -> StoreResult<Option<(i64, String)>> {
    db.query_row(
        "SELECT rv, body FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
        (&key.kind, &key.namespace, &key.name),
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
    )
    .optional()
    .map_err(backend)
}

impl SqliteStore {
    /// Shared conditional write for `update` and `update_status`.
    fn write_if(&self, obj: &Json, expected: &str, merge: impl Fn(Json, &Json) -> Json) -> StoreResult<Json> {
        let started = std::time::Instant::now();
        let key = key_of(obj)?;
        let want = parse_rv(&key, expected)?;
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(backend)?;
        let (rv, body) = read_row(&tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if rv != want {
            counter!("store_conflict_total", 1u64);
            return Err(StoreError::Conflict { key, expected: expected.to_string(), actual: rv.to_string() });
        }
        let current = decode(&body, rv)?;
        let next = merge(current, obj);
        let text = serde_json::to_string(&next).map_err(backend)?;
        let changed = tx
            .execute(
                "UPDATE objects SET rv = rv + 1, body = ?1 WHERE kind = ?2 AND namespace = ?3 AND name = ?4 AND rv = ?5",
                (&text, &key.kind, &key.namespace, &key.name, want),
            )
            .map_err(backend)?;
        if changed != 1 {
            return Err(StoreError::Conflict { key, expected: expected.to_string(), actual: "?".into() });
        }
        tx.commit().map_err(backend)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        decode(&text, want + 1)
    }
}

#[async_trait::async_trait]
impl ObjectStore for SqliteStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Json> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let (rv, body) = read_row(&db, key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        decode(&body, rv)
    }

    async fn create(&self, mut obj: Json) -> StoreResult<Json> {
        let key = key_of(&obj)?;
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(key.namespace.clone()));
            meta.insert("generation".into(), Json::from(1u64));
            meta.remove("resourceVersion");
            meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
            meta.entry("creationTimestamp").or_insert_with(|| Json::String(chrono::Utc::now().to_rfc3339()));
        }
        let text = serde_json::to_string(&obj).map_err(backend)?;
        let db = self.conn()?;
        let res = db.execute(
            "INSERT INTO objects(kind, namespace, name, rv, body) VALUES (?1, ?2, ?3, 1, ?4)",
            (&key.kind, &key.namespace, &key.name, &text),
        );
        match res {
            Ok(_) => {
                counter!("persist_put_total", 1u64);
                decode(&text, 1)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(StoreError::AlreadyExists(key))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn update(&self, obj: Json, expected_version: &str) -> StoreResult<Json> {
        self.write_if(&obj, expected_version, |current, incoming| {
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
            if let Some(meta) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                for k in ["uid", "creationTimestamp", "namespace"] {
                    if let Some(v) = cur_meta.and_then(|m| m.get(k)) { meta.insert(k.into(), v.clone()); }
                }
                meta.insert("generation".into(), Json::from(if spec_changed { generation + 1 } else { generation }));
            }
            next
        })
    }

    async fn update_status(&self, obj: Json, expected_version: &str) -> StoreResult<Json> {
        self.write_if(&obj, expected_version, |mut current, incoming| {
            if let Some(root) = current.as_object_mut() {
                match incoming.get("status") {
                    Some(s) => { root.insert("status".into(), s.clone()); }
                    None => { root.remove("status"); }
                }
            }
            current
        })
    }

    async fn delete(&self, key: &ObjectKey, expected_version: &str) -> StoreResult<()> {
        let want = parse_rv(key, expected_version)?;
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(backend)?;
        let (rv, _) = read_row(&tx, key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if rv != want {
            counter!("store_conflict_total", 1u64);
            return Err(StoreError::Conflict { key: key.clone(), expected: expected_version.to_string(), actual: rv.to_string() });
        }
        tx.execute(
            "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3 AND rv = ?4",
            (&key.kind, &key.namespace, &key.name, want),
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        counter!("persist_delete_total", 1u64);
        Ok(())
    }

    async fn list(&self, kind: &str, namespace: &str, label: Option<(&str, &str)>) -> StoreResult<Vec<Json>> {
        let db = self.conn()?;
        let mut stmt = db
            .prepare("SELECT rv, body FROM objects WHERE kind = ?1 AND namespace = ?2 ORDER BY name")
            .map_err(backend)?;
        let mut rows = stmt.query((kind, namespace)).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let rv: i64 = row.get(0).map_err(backend)?;
            let body: String = row.get(1).map_err(backend)?;
            let obj = decode(&body, rv)?;
            if label.map_or(true, |(k, v)| has_label(&obj, k, v)) {
                out.push(obj);
            }
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".defsmith");
        let _ = std::fs::create_dir_all(&p);
        p.push("defsmith.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "defsmith.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use defsmith_store::resource_version;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("defsmith-test-{}.db", uuid::Uuid::new_v4());
        dir.join(f).to_string_lossy().to_string()
    }

    fn rev(name: &str, n: u64) -> Json {
        json!({
            "kind": "DefinitionRevision",
            "metadata": { "name": name, "namespace": "default", "labels": { "definition.oam.dev/name": "t" } },
            "spec": { "revision": n },
        })
    }

    #[tokio::test]
    async fn create_get_update_roundtrip() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let created = s.create(rev("t-v1", 1)).await.unwrap();
        assert_eq!(resource_version(&created), "1");
        assert!(matches!(s.create(rev("t-v1", 1)).await.unwrap_err(), StoreError::AlreadyExists(_)));

        let key = ObjectKey::new("DefinitionRevision", "default", "t-v1");
        let got = s.get(&key).await.unwrap();
        assert_eq!(got, created);

        let mut edited = got.clone();
        edited["spec"]["revision"] = json!(5);
        let after = s.update(edited.clone(), "1").await.unwrap();
        assert_eq!(resource_version(&after), "2");
        assert_eq!(after["metadata"]["generation"], json!(2));

        let err = s.update(edited, "1").await.unwrap_err();
        assert!(err.is_conflict());

        assert!(s.delete(&key, "1").await.unwrap_err().is_conflict());
        s.delete(&key, "2").await.unwrap();
        assert!(s.get(&key).await.unwrap_err().is_not_found());
        assert!(s.delete(&key, "2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_by_label_and_reopen() {
        let path = temp_db();
        {
            let s = SqliteStore::open(&path).unwrap();
            s.create(rev("t-v2", 2)).await.unwrap();
            s.create(rev("t-v1", 1)).await.unwrap();
            let mut other = rev("u-v1", 1);
            other["metadata"]["labels"] = json!({ "definition.oam.dev/name": "u" });
            s.create(other).await.unwrap();
        }
        let s = SqliteStore::open(&path).unwrap();
        let rows = s.list("DefinitionRevision", "default", Some(("definition.oam.dev/name", "t"))).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["metadata"]["name"].as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["t-v1", "t-v2"]);
        assert!(s.get(&ObjectKey::new("DefinitionRevision", "default", "missing")).await.unwrap_err().is_not_found());
    }
}
