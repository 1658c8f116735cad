#![forbid(unsafe_code)]

use std::sync::Arc;

use defsmith_core::ObjectKey;
use defsmith_store::{resource_version, MemoryStore, ObjectStore, StoreError};
use serde_json::json;

fn cm(name: &str, value: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "ns", "labels": { "app": "demo" } },
        "data": { "k": value },
    })
}

#[tokio::test]
async fn create_assigns_identity_and_rejects_duplicates() {
    let store = MemoryStore::new();
    let created = store.create(cm("a", "1")).await.unwrap();
    assert!(!resource_version(&created).is_empty());
    assert!(created["metadata"]["uid"].is_string());
    assert_eq!(created["metadata"]["generation"], json!(1));

    let err = store.create(cm("a", "2")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
    assert!(err.is_conflict());
    assert_eq!(store.epoch(), 1);
}

#[tokio::test]
async fn stale_writer_is_rejected() {
    let store = MemoryStore::new();
    let v1 = store.create(cm("a", "1")).await.unwrap();
    let rv1 = resource_version(&v1).to_string();

    let v2 = store.update(cm("a", "2"), &rv1).await.unwrap();
    assert_ne!(resource_version(&v2), rv1);

    let err = store.update(cm("a", "3"), &rv1).await.unwrap_err();
    match err {
        StoreError::Conflict { expected, actual, .. } => {
            assert_eq!(expected, rv1);
            assert_eq!(actual, resource_version(&v2));
        }
        other => panic!("unexpected {:?}", other),
    }
    let cur = store.get(&ObjectKey::new("ConfigMap", "ns", "a")).await.unwrap();
    assert_eq!(cur["data"]["k"], json!("2"));
}

#[tokio::test]
async fn status_and_body_are_written_separately() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("TraitDefinition", "ns", "t");
    let created = store
        .create(json!({ "kind": "TraitDefinition", "metadata": { "name": "t", "namespace": "ns" }, "spec": { "x": 1 } }))
        .await
        .unwrap();

    let mut with_status = created.clone();
    with_status["status"] = json!({ "latestRevision": { "name": "t-v1", "revision": 1 } });
    with_status["spec"] = json!({ "x": 999 });
    let after = store.update_status(with_status, resource_version(&created)).await.unwrap();
    assert_eq!(after["spec"], json!({ "x": 1 }), "status write must not touch spec");
    assert_eq!(after["status"]["latestRevision"]["name"], json!("t-v1"));

    let mut edited = after.clone();
    edited["spec"] = json!({ "x": 2 });
    edited.as_object_mut().unwrap().remove("status");
    let after = store.update(edited, resource_version(&after)).await.unwrap();
    assert_eq!(after["status"]["latestRevision"]["name"], json!("t-v1"), "body write must keep status");
    assert_eq!(after["metadata"]["generation"], json!(2));

    assert_eq!(store.get(&key).await.unwrap(), after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_concurrent_writer_wins() {
    let store = Arc::new(MemoryStore::new());
    let base = store.create(cm("race", "0")).await.unwrap();
    let rv = resource_version(&base).to_string();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        let rv = rv.clone();
        tasks.push(tokio::spawn(async move { store.update(cm("race", &i.to_string()), &rv).await }));
    }
    let mut wins = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected {:?}", e),
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn list_filters_by_namespace_and_label() {
    let store = MemoryStore::new();
    let mut rx = store.subscribe_epoch();
    store.create(cm("b", "1")).await.unwrap();
    store.create(cm("a", "1")).await.unwrap();
    let mut other = cm("c", "1");
    other["metadata"]["labels"] = json!({ "app": "other" });
    store.create(other).await.unwrap();
    let mut elsewhere = cm("d", "1");
    elsewhere["metadata"]["namespace"] = json!("other-ns");
    store.create(elsewhere).await.unwrap();

    let all = store.list("ConfigMap", "ns", None).await.unwrap();
    assert_eq!(all.len(), 3);
    let demo = store.list("ConfigMap", "ns", Some(("app", "demo"))).await.unwrap();
    let names: Vec<_> = demo.iter().map(|o| o["metadata"]["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a", "b"]);

    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), 4);
}

#[tokio::test]
async fn delete_is_conditional_and_fences_stale_writers() {
    let store = MemoryStore::new();
    let key = ObjectKey::new("ConfigMap", "ns", "a");
    let v1 = store.create(cm("a", "1")).await.unwrap();
    let rv1 = resource_version(&v1).to_string();
    let v2 = store.update(cm("a", "2"), &rv1).await.unwrap();

    assert!(store.delete(&key, &rv1).await.unwrap_err().is_conflict());
    let epoch = store.epoch();
    store.delete(&key, resource_version(&v2)).await.unwrap();
    assert_eq!(store.epoch(), epoch + 1);
    assert!(store.get_opt(&key).await.unwrap().is_none());
    assert!(store.delete(&key, resource_version(&v2)).await.unwrap_err().is_not_found());
    assert!(store.update(cm("a", "3"), resource_version(&v2)).await.unwrap_err().is_not_found());

    // The name is free again.
    store.create(cm("a", "4")).await.unwrap();
}
