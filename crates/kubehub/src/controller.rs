use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use defsmith_core::{ObjectKey, DEFAULT_NAMESPACE};
use defsmith_engine::Reconciler;
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{api_resource, KeyCoalescer};

fn key_of(kind: &str, obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    let ns = obj.metadata.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    Some(ObjectKey::new(kind, ns, name))
}

/// List+watch `kind` and send the key of every applied, deleted or relisted
/// object. Returns when the receiving side is gone or the stream ends.
pub async fn start_watcher(client: Client, kind: &str, namespace: Option<&str>, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let ar = api_resource(kind).ok_or_else(|| anyhow!("no API resource for kind {}", kind))?;
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let objs = match ev {
            Event::Applied(o) | Event::Deleted(o) => vec![o],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list
            }
        };
        for o in objs.iter() {
            let Some(key) = key_of(kind, o) else { continue };
            if tx.send(key).await.is_err() {
                debug!(kind, "reconcile queue closed; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind, "watcher stream ended");
    Ok(())
}

/// Reconcile keys from `rx` until it closes and all queued work and pending
/// retries are done.
///
/// Keys are coalesced per owner, so one batch never reconciles the same owner
/// twice. Transient failures are requeued after `requeue_delay`; other
/// failures wait for the next change event of that definition.
pub async fn run_controller(
    reconciler: Arc<dyn Reconciler>,
    mut rx: mpsc::Receiver<ObjectKey>,
    cap: usize,
    requeue_delay: Duration,
) {
    let mut queue = KeyCoalescer::with_capacity(cap);
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<ObjectKey>();
    let mut pending_retries = 0usize;
    let mut input_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(8));
    loop {
        tokio::select! {
            maybe = rx.recv(), if input_open => match maybe {
                Some(key) => queue.push(key),
                None => {
                    debug!("key channel closed; draining controller queue");
                    input_open = false;
                }
            },
            Some(key) = retry_rx.recv(), if pending_retries > 0 => {
                pending_retries -= 1;
                queue.push(key);
            }
            _ = ticker.tick() => {
                let batch = queue.drain_ready();
                if !batch.is_empty() {
                    let results = futures::future::join_all(batch.into_iter().map(|key| {
                        let r = reconciler.clone();
                        async move {
                            let res = r.reconcile(&key).await;
                            (key, res)
                        }
                    }))
                    .await;
                    for (key, res) in results {
                        match res {
                            Ok(_) => {}
                            Err(e) if e.is_transient() => {
                                counter!("reconcile_requeue_total", 1u64);
                                warn!(owner = %key, error = %e, delay_ms = requeue_delay.as_millis() as u64, "reconcile failed; requeueing");
                                pending_retries += 1;
                                let tx = retry_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(requeue_delay).await;
                                    let _ = tx.send(key);
                                });
                            }
                            Err(e) => {
                                counter!("reconcile_error_total", 1u64);
                                warn!(owner = %key, error = %e, "reconcile failed; waiting for the next change");
                            }
                        }
                    }
                }
                if queue.dropped() > 0 {
                    debug!(dropped = queue.dropped(), "controller queue overflowed");
                }
                if !input_open && pending_retries == 0 && queue.is_empty() {
                    break;
                }
            }
        }
    }
    info!("controller stopped");
}
