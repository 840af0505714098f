#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use gantry_core::{ChangeEvent, ChangeKind, Cluster, Route};
use gantry_kubehub::{spawn_change_feed, FeedConfig, FeedError, FeedHealth, FeedState, MemoryStore};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn fast_config() -> FeedConfig {
    FeedConfig { backoff_base: Duration::from_millis(5), backoff_max: Duration::from_millis(20), queue_cap: 64 }
}

async fn next<T>(rx: &mut mpsc::Receiver<ChangeEvent<T>>) -> ChangeEvent<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for change event")
        .expect("feed closed")
}

#[tokio::test]
async fn lists_then_streams_deltas() {
    let store = Arc::new(MemoryStore::new());
    store.put("routes", "a", json!({"clusterId": "c1"}));
    store.put("routes", "b", json!({}));
    let health = FeedHealth::new();
    let cancel = CancellationToken::new();
    let (mut rx, handle) = spawn_change_feed::<Route>(store.clone(), fast_config(), health.clone(), cancel.clone());

    let mut listed = Vec::new();
    loop {
        match next(&mut rx).await {
            ChangeEvent::Listed(r) => listed.push(r.id.to_string()),
            ChangeEvent::Synced => break,
            other => panic!("unexpected event before sync: {:?}", other),
        }
    }
    assert_eq!(listed, vec!["a", "b"]);
    assert_eq!(health.get(gantry_core::ResourceKind::Route), Some(FeedState::Live));

    store.put("routes", "c", json!({}));
    store.put("routes", "a", json!({"clusterId": "c2"}));
    store.delete("routes", "b");
    assert!(matches!(next(&mut rx).await, ChangeEvent::Created(r) if r.id.as_str() == "c"));
    match next(&mut rx).await {
        ChangeEvent::Updated(r) => assert_eq!(r.cluster_id.unwrap().as_str(), "c2"),
        other => panic!("expected update, got {:?}", other),
    }
    match next(&mut rx).await {
        ChangeEvent::Deleted { id, previous } => {
            assert_eq!(id.as_str(), "b");
            assert!(previous.is_some());
        }
        other => panic!("expected delete, got {:?}", other),
    }

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn terminated_feed_is_interrupted_and_relisted() {
    let store = Arc::new(MemoryStore::new());
    store.put("clusters", "c1", json!({}));
    let cancel = CancellationToken::new();
    let (mut rx, _handle) = spawn_change_feed::<Cluster>(store.clone(), fast_config(), FeedHealth::new(), cancel.clone());

    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Listed);
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Synced);

    store.terminate_feeds("clusters");
    // Written while the adapter is reconnecting; must show up in the relist.
    store.put("clusters", "c2", json!({}));
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Interrupted);

    let mut relisted = Vec::new();
    loop {
        match next(&mut rx).await {
            ChangeEvent::Listed(c) => relisted.push(c.id.to_string()),
            // The write may also be observed on the reopened feed before the listing.
            ChangeEvent::Created(c) => relisted.push(c.id.to_string()),
            ChangeEvent::Synced => break,
            other => panic!("unexpected event during relist: {:?}", other),
        }
    }
    relisted.sort();
    relisted.dedup();
    assert_eq!(relisted, vec!["c1", "c2"]);
    cancel.cancel();
}

#[tokio::test]
async fn key_only_deletes_carry_no_previous() {
    let store = Arc::new(MemoryStore::new().without_pre_images());
    store.put("routes", "a", json!({"clusterId": "c1"}));
    let cancel = CancellationToken::new();
    let (mut rx, _handle) = spawn_change_feed::<Route>(store.clone(), fast_config(), FeedHealth::new(), cancel.clone());
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Listed);
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Synced);

    assert!(store.delete("routes", "a").is_some());
    match next(&mut rx).await {
        ChangeEvent::Deleted { id, previous } => {
            assert_eq!(id.as_str(), "a");
            assert!(previous.is_none());
        }
        other => panic!("expected delete, got {:?}", other),
    }
    cancel.cancel();
}

#[tokio::test]
async fn malformed_documents_are_dropped() {
    let store = Arc::new(MemoryStore::new());
    store.put("routes", "good", json!({"order": 1}));
    store.put("routes", "bad", json!({"order": "first"}));
    let cancel = CancellationToken::new();
    let (mut rx, _handle) = spawn_change_feed::<Route>(store.clone(), fast_config(), FeedHealth::new(), cancel.clone());

    assert!(matches!(next(&mut rx).await, ChangeEvent::Listed(r) if r.id.as_str() == "good"));
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Synced);

    store.put("routes", "worse", json!("just a string"));
    store.put("routes", "fine", json!({}));
    assert!(matches!(next(&mut rx).await, ChangeEvent::Created(r) if r.id.as_str() == "fine"));
    cancel.cancel();
}

#[tokio::test]
async fn fatal_error_fails_health_and_ends_task() {
    let store = Arc::new(MemoryStore::new());
    store.put("certificates", "cert", json!({"hosts": ["a.example"]}));
    let health = FeedHealth::new();
    let (mut rx, handle) =
        spawn_change_feed::<gantry_core::Certificate>(store.clone(), fast_config(), health.clone(), CancellationToken::new());

    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Listed);
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Synced);

    store.fail_collection("certificates", "permission denied");
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Interrupted);

    let res = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(matches!(res, Err(FeedError::Fatal { .. })));
    assert!(rx.recv().await.is_none());
    assert_eq!(
        health.get(gantry_core::ResourceKind::Certificate),
        Some(FeedState::Failed { reason: "permission denied".into() })
    );
    assert!(!health.is_ready());
}

#[tokio::test]
async fn cancellation_ends_stream_cleanly() {
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let (mut rx, handle) = spawn_change_feed::<Route>(store, fast_config(), FeedHealth::new(), cancel.clone());
    assert_eq!(next(&mut rx).await.kind(), ChangeKind::Synced);
    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
    assert!(rx.recv().await.is_none());
}
