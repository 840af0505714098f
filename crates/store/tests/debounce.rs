#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use gantry_core::{Resource, ResourceKind, Route};
use gantry_store::{spawn_merge, Debouncer, MaterializedView, ResourceViews, ViewReceivers};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Tx<T> = watch::Sender<Arc<MaterializedView<T>>>;

struct Inputs {
    routes: Tx<Route>,
    clusters: Tx<gantry_core::Cluster>,
    middlewares: Tx<gantry_core::Middleware>,
    certificates: Tx<gantry_core::Certificate>,
    auth: Tx<gantry_core::AuthenticationPolicy>,
    discovery: Tx<gantry_core::ServiceDiscovery>,
}

fn view<T: Resource>(primed: bool) -> Arc<MaterializedView<T>> {
    Arc::new(if primed { MaterializedView::from_iter(Vec::new()) } else { MaterializedView::default() })
}

fn inputs(primed: bool) -> (Inputs, ViewReceivers) {
    let (routes, routes_rx) = watch::channel(view(primed));
    let (clusters, clusters_rx) = watch::channel(view(primed));
    let (middlewares, middlewares_rx) = watch::channel(view(primed));
    let (certificates, certificates_rx) = watch::channel(view(primed));
    let (auth, auth_rx) = watch::channel(view(primed));
    let (discovery, discovery_rx) = watch::channel(view(primed));
    (
        Inputs { routes, clusters, middlewares, certificates, auth, discovery },
        ViewReceivers {
            routes: routes_rx,
            clusters: clusters_rx,
            middlewares: middlewares_rx,
            certificates: certificates_rx,
            authentication_policies: auth_rx,
            service_discoveries: discovery_rx,
        },
    )
}

fn routes(n: usize) -> Arc<MaterializedView<Route>> {
    Arc::new((0..n).map(|i| Route::new(format!("r{}", i), None)).collect())
}

struct Harness {
    inputs: Inputs,
    pings: mpsc::Sender<ResourceKind>,
    ticks: mpsc::UnboundedReceiver<(Instant, ResourceViews)>,
    cancel: CancellationToken,
}

fn start(primed: bool, quiet_ms: u64, max_ms: u64) -> Harness {
    let (inputs, receivers) = inputs(primed);
    let (pings, ping_rx) = mpsc::channel(64);
    let (tick_tx, ticks) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let debouncer = Debouncer::new(Duration::from_millis(quiet_ms), Duration::from_millis(max_ms));
    spawn_merge(receivers, ping_rx, debouncer, cancel.clone(), move |views| {
        let _ = tick_tx.send((Instant::now(), views));
    });
    Harness { inputs, pings, ticks, cancel }
}

#[tokio::test(start_paused = true)]
async fn burst_within_quiet_window_yields_one_tick_with_final_state() {
    let mut h = start(true, 100, 1000);
    let t0 = Instant::now();
    for n in 1..=5 {
        h.inputs.routes.send_replace(routes(n));
        h.pings.send(ResourceKind::Route).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (at, views) = h.ticks.recv().await.unwrap();
    assert_eq!(views.routes.len(), 5);
    assert!(at - t0 >= Duration::from_millis(140));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.ticks.try_recv().is_err());
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn change_after_window_reopens_emits_again() {
    let mut h = start(true, 100, 1000);
    h.inputs.clusters.send_replace(Arc::new(vec![gantry_core::Cluster::new("c1")].into_iter().collect()));
    h.pings.send(ResourceKind::Cluster).await.unwrap();
    let (_, first) = h.ticks.recv().await.unwrap();
    assert_eq!(first.clusters.len(), 1);

    h.inputs.routes.send_replace(routes(2));
    h.pings.send(ResourceKind::Route).await.unwrap();
    let (_, second) = h.ticks.recv().await.unwrap();
    assert_eq!(second.routes.len(), 2);
    assert_eq!(second.clusters.len(), 1);
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn continuous_updates_still_tick_at_max_delay() {
    let mut h = start(true, 100, 1000);
    let t0 = Instant::now();
    for n in 0..60 {
        h.inputs.routes.send_replace(routes(n));
        h.pings.send(ResourceKind::Route).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mut at = Vec::new();
    while let Ok((t, _)) = h.ticks.try_recv() {
        at.push(t - t0);
    }
    assert!(at.len() >= 2, "expected periodic ticks, got {:?}", at);
    assert!(at[0] <= Duration::from_millis(1000));
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn no_tick_until_every_view_is_primed() {
    let mut h = start(false, 100, 1000);
    h.inputs.routes.send_replace(routes(3));
    h.pings.send(ResourceKind::Route).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.ticks.try_recv().is_err());

    h.inputs.clusters.send_replace(view(true));
    h.inputs.middlewares.send_replace(view(true));
    h.inputs.certificates.send_replace(view(true));
    h.inputs.auth.send_replace(view(true));
    h.inputs.discovery.send_replace(view(true));
    h.pings.send(ResourceKind::ServiceDiscovery).await.unwrap();
    let (_, views) = h.ticks.recv().await.unwrap();
    assert!(views.is_primed());
    assert_eq!(views.routes.len(), 3);
    h.cancel.cancel();
}
