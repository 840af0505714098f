//! Gantry store: materialized views, the debounce/merge stage and the snapshot publisher.
//!
//! Adapters feed one accumulator task per kind; accumulators publish their views on
//! watch channels and ping the merge stage, which builds and installs a snapshot per
//! quiet period. Readers go through a [`SnapshotHandle`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use gantry_core::{
    AuthenticationPolicy, Certificate, Cluster, Middleware, Resource, ResourceKind, Route, ServiceDiscovery,
};
use gantry_kubehub::{
    decode_document, spawn_change_feed, DocumentStore, FeedConfig, FeedError, FeedHealth, FeedState, StoreError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod merge;
mod publish;
mod snapshot;
mod view;

pub use merge::{spawn_merge, Debouncer, ResourceViews, ViewReceivers};
pub use publish::{InvalidationSignal, SnapshotHandle, SnapshotPublisher};
pub use snapshot::{
    BuildError, ClusterConfig, ConfigurationSnapshot, PathPattern, Reference, RouteConfig, SnapshotBuilder,
    SnapshotSummary,
};
pub use view::{spawn_accumulator, Accumulator, MaterializedView, ViewChange};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub quiet_window: Duration,
    pub max_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self { Self { quiet_window: Duration::from_millis(100), max_delay: Duration::from_secs(1) } }
}

/// A running pipeline. `join` completes once every task has stopped and yields the
/// first fatal feed error, if any.
pub struct Pipeline {
    pub handle: SnapshotHandle,
    pub health: FeedHealth,
    pub join: JoinHandle<Result<(), FeedError>>,
}

struct KindTasks<T: Resource> {
    view: watch::Receiver<Arc<MaterializedView<T>>>,
    feed: JoinHandle<Result<(), FeedError>>,
    accumulator: JoinHandle<()>,
}

fn spawn_kind<T: Resource>(
    store: &Arc<dyn DocumentStore>,
    feed_cfg: &FeedConfig,
    health: &FeedHealth,
    cancel: &CancellationToken,
    pings: &mpsc::Sender<ResourceKind>,
) -> KindTasks<T> {
    let (events, feed) = spawn_change_feed::<T>(Arc::clone(store), feed_cfg.clone(), health.clone(), cancel.child_token());
    let (view, accumulator) = spawn_accumulator(events, pings.clone());
    KindTasks { view, feed, accumulator }
}

/// Wire adapters, accumulators, merge stage and publisher for every kind against `store`.
pub fn spawn_pipeline(
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    feed_cfg: FeedConfig,
    cancel: CancellationToken,
) -> Pipeline {
    let health = FeedHealth::new();
    for kind in ResourceKind::ALL {
        health.set(kind, FeedState::Starting);
    }
    let (ping_tx, ping_rx) = mpsc::channel(ResourceKind::ALL.len() * 4);

    let routes = spawn_kind::<Route>(&store, &feed_cfg, &health, &cancel, &ping_tx);
    let clusters = spawn_kind::<Cluster>(&store, &feed_cfg, &health, &cancel, &ping_tx);
    let middlewares = spawn_kind::<Middleware>(&store, &feed_cfg, &health, &cancel, &ping_tx);
    let certificates = spawn_kind::<Certificate>(&store, &feed_cfg, &health, &cancel, &ping_tx);
    let auth = spawn_kind::<AuthenticationPolicy>(&store, &feed_cfg, &health, &cancel, &ping_tx);
    let discovery = spawn_kind::<ServiceDiscovery>(&store, &feed_cfg, &health, &cancel, &ping_tx);
    drop(ping_tx);

    let views = ViewReceivers {
        routes: routes.view,
        clusters: clusters.view,
        middlewares: middlewares.view,
        certificates: certificates.view,
        authentication_policies: auth.view,
        service_discoveries: discovery.view,
    };
    let publisher = Arc::new(SnapshotPublisher::new());
    let handle = publisher.handle();
    let debouncer = Debouncer::new(config.quiet_window, config.max_delay);
    let merge = spawn_merge(views, ping_rx, debouncer, cancel.clone(), move |views| {
        // Failures are logged and counted by the publisher; the previous snapshot stays current.
        let _ = publisher.publish(&views);
    });
    info!(store = store.name(), quiet_ms = %config.quiet_window.as_millis(), "pipeline started");

    let feeds = vec![routes.feed, clusters.feed, middlewares.feed, certificates.feed, auth.feed, discovery.feed];
    let accumulators = vec![
        routes.accumulator,
        clusters.accumulator,
        middlewares.accumulator,
        certificates.accumulator,
        auth.accumulator,
        discovery.accumulator,
    ];
    let join = tokio::spawn(async move {
        let mut first_err = None;
        for feed in feeds {
            match feed.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(join_err) => warn!(error = %join_err, "change feed task aborted"),
            }
        }
        for acc in accumulators {
            let _ = acc.await;
        }
        let _ = merge.await;
        info!("pipeline stopped");
        first_err.map_or(Ok(()), Err)
    });

    Pipeline { handle, health, join }
}

async fn load_kind<T: Resource>(store: &dyn DocumentStore) -> Result<Arc<MaterializedView<T>>, StoreError> {
    let docs = store.list(T::KIND.collection()).await?;
    let listed = docs.len();
    let view: MaterializedView<T> = docs.into_iter().filter_map(|doc| decode_document::<T>(&doc.id, doc.body)).collect();
    if view.len() < listed {
        warn!(kind = %T::KIND, dropped = listed - view.len(), "malformed documents skipped");
    }
    Ok(Arc::new(view))
}

/// List every collection once and return the resulting views, without opening any feed.
pub async fn load_views(store: &dyn DocumentStore) -> Result<ResourceViews, StoreError> {
    Ok(ResourceViews {
        routes: load_kind(store).await?,
        clusters: load_kind(store).await?,
        middlewares: load_kind(store).await?,
        certificates: load_kind(store).await?,
        authentication_policies: load_kind(store).await?,
        service_discoveries: load_kind(store).await?,
    })
}
