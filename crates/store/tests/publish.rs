#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gantry_core::{Cluster, Route};
use gantry_store::{ResourceViews, SnapshotPublisher};

/// Views whose snapshot carries `n` routes, each pointing at one of `n` clusters.
fn views(n: usize) -> ResourceViews {
    ResourceViews {
        routes: Arc::new((0..n).map(|i| Route::new(format!("r{}", i), Some(&format!("c{}", i)))).collect()),
        clusters: Arc::new((0..n).map(|i| Cluster::new(format!("c{}", i))).collect()),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_see_whole_snapshots_and_no_early_invalidation() {
    let publisher = Arc::new(SnapshotPublisher::new());
    let handle = publisher.handle();
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let handle = handle.clone();
        let done = Arc::clone(&done);
        readers.push(tokio::spawn(async move {
            let mut observed = 0u64;
            while !done.load(Ordering::Acquire) {
                let snap = handle.current();
                // Version n was built from n routes and n clusters, all resolved.
                assert_eq!(snap.routes.len() as u64, snap.version);
                assert_eq!(snap.clusters.len() as u64, snap.version);
                assert_eq!(snap.summary().dangling_references, 0);
                if snap.invalidation().is_invalidated() {
                    assert!(handle.current().version > snap.version, "invalidated while still current");
                }
                observed = observed.max(snap.version);
                tokio::task::yield_now().await;
            }
            observed
        }));
    }

    let writer = {
        let publisher = Arc::clone(&publisher);
        tokio::task::spawn_blocking(move || {
            for n in 1..=200 {
                let snap = publisher.publish(&views(n)).unwrap();
                assert_eq!(snap.version, n as u64);
            }
        })
    };
    writer.await.unwrap();
    done.store(true, Ordering::Release);
    for r in readers {
        assert!(r.await.unwrap() <= 200);
    }
    assert_eq!(handle.current().version, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_superseded_snapshot_is_invalidated_exactly_when_replaced() {
    let publisher = SnapshotPublisher::new();
    let handle = publisher.handle();
    let mut history = vec![handle.current()];
    for n in 1..=5 {
        history.push(publisher.publish(&views(n)).unwrap());
    }
    let (last, superseded) = history.split_last().unwrap();
    for snap in superseded {
        assert!(snap.invalidation().is_invalidated());
        assert!(snap.invalidation().invalidated().await);
    }
    assert!(!last.invalidation().is_invalidated());
    assert!(Arc::ptr_eq(last, &handle.current()));
}

#[test]
fn dangling_references_are_carried_through() {
    let publisher = SnapshotPublisher::new();
    let mut route = Route::new("r1", Some("missing-cluster"));
    route.middlewares = vec!["auth-headers".into()];
    route.authentication_policy = Some("oidc".into());
    let views = ResourceViews { routes: Arc::new(vec![route].into_iter().collect()), ..Default::default() };

    let snap = publisher.publish(&views).unwrap();
    let r = snap.route("r1").unwrap();
    assert_eq!(r.cluster.as_ref().unwrap().id().as_str(), "missing-cluster");
    assert!(r.cluster.as_ref().unwrap().is_dangling());
    assert!(r.middlewares[0].is_dangling());
    assert!(r.authentication_policy.as_ref().unwrap().is_dangling());
    assert_eq!(snap.summary().dangling_references, 3);
}
