//! Debounce & merge: combine the latest view of every kind into one tick per quiet period.

use std::sync::Arc;
use std::time::Duration;

use gantry_core::{
    AuthenticationPolicy, Certificate, Cluster, Middleware, ResourceKind, Route, ServiceDiscovery,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::view::MaterializedView;

/// Latest view of every resource kind at one point in logical time.
#[derive(Debug, Clone, Default)]
pub struct ResourceViews {
    pub routes: Arc<MaterializedView<Route>>,
    pub clusters: Arc<MaterializedView<Cluster>>,
    pub middlewares: Arc<MaterializedView<Middleware>>,
    pub certificates: Arc<MaterializedView<Certificate>>,
    pub authentication_policies: Arc<MaterializedView<AuthenticationPolicy>>,
    pub service_discoveries: Arc<MaterializedView<ServiceDiscovery>>,
}

impl ResourceViews {
    /// Every kind has completed its first listing.
    pub fn is_primed(&self) -> bool {
        self.routes.is_primed()
            && self.clusters.is_primed()
            && self.middlewares.is_primed()
            && self.certificates.is_primed()
            && self.authentication_policies.is_primed()
            && self.service_discoveries.is_primed()
    }

    /// Both hold the very same view of every kind.
    pub fn same_as(&self, other: &ResourceViews) -> bool {
        Arc::ptr_eq(&self.routes, &other.routes)
            && Arc::ptr_eq(&self.clusters, &other.clusters)
            && Arc::ptr_eq(&self.middlewares, &other.middlewares)
            && Arc::ptr_eq(&self.certificates, &other.certificates)
            && Arc::ptr_eq(&self.authentication_policies, &other.authentication_policies)
            && Arc::ptr_eq(&self.service_discoveries, &other.service_discoveries)
    }

    pub fn len(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Route => self.routes.len(),
            ResourceKind::Cluster => self.clusters.len(),
            ResourceKind::Middleware => self.middlewares.len(),
            ResourceKind::Certificate => self.certificates.len(),
            ResourceKind::AuthenticationPolicy => self.authentication_policies.len(),
            ResourceKind::ServiceDiscovery => self.service_discoveries.len(),
        }
    }
}

/// Watch receivers of the six accumulators.
#[derive(Clone)]
pub struct ViewReceivers {
    pub routes: watch::Receiver<Arc<MaterializedView<Route>>>,
    pub clusters: watch::Receiver<Arc<MaterializedView<Cluster>>>,
    pub middlewares: watch::Receiver<Arc<MaterializedView<Middleware>>>,
    pub certificates: watch::Receiver<Arc<MaterializedView<Certificate>>>,
    pub authentication_policies: watch::Receiver<Arc<MaterializedView<AuthenticationPolicy>>>,
    pub service_discoveries: watch::Receiver<Arc<MaterializedView<ServiceDiscovery>>>,
}

impl ViewReceivers {
    pub fn latest(&self) -> ResourceViews {
        ResourceViews {
            routes: self.routes.borrow().clone(),
            clusters: self.clusters.borrow().clone(),
            middlewares: self.middlewares.borrow().clone(),
            certificates: self.certificates.borrow().clone(),
            authentication_policies: self.authentication_policies.borrow().clone(),
            service_discoveries: self.service_discoveries.borrow().clone(),
        }
    }
}

/// Quiet-window debouncer with a maximum-delay ceiling.
///
/// The deadline is `last + quiet`, but never later than `first + max_delay`, so a
/// continuous stream of updates still produces a tick at least every `max_delay`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet: Duration,
    max_delay: Duration,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration, max_delay: Duration) -> Self {
        Self { quiet, max_delay: max_delay.max(quiet), first: None, last: None }
    }

    pub fn record(&mut self, now: Instant) {
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    pub fn is_pending(&self) -> bool { self.first.is_some() }

    pub fn deadline(&self) -> Option<Instant> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => Some((last + self.quiet).min(first + self.max_delay)),
            _ => None,
        }
    }

    /// Clear the pending burst.
    pub fn reset(&mut self) {
        self.first = None;
        self.last = None;
    }
}

/// Spawn the merge stage. `on_tick` runs on the stage's task, so ticks are serialized.
/// No tick is emitted until every view is primed.
pub fn spawn_merge<F>(
    views: ViewReceivers,
    mut pings: mpsc::Receiver<ResourceKind>,
    mut debouncer: Debouncer,
    cancel: CancellationToken,
    mut on_tick: F,
) -> JoinHandle<()>
where
    F: FnMut(ResourceViews) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticks: u64 = 0;
        let mut last: Option<ResourceViews> = None;
        loop {
            let deadline = debouncer.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                ping = pings.recv() => match ping {
                    Some(kind) => {
                        debug!(%kind, "view changed");
                        debouncer.record(Instant::now());
                    }
                    None => {
                        debug!("ping channel closed; stopping merge stage");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debouncer.reset();
                    let latest = views.latest();
                    if !latest.is_primed() {
                        debug!("waiting for every kind to complete its first listing");
                        continue;
                    }
                    if last.as_ref().is_some_and(|l| l.same_as(&latest)) {
                        debug!("views unchanged since last tick");
                        continue;
                    }
                    ticks += 1;
                    metrics::counter!("merge_ticks_total", 1);
                    debug!(tick = ticks, "merge tick");
                    last = Some(latest.clone());
                    on_tick(latest);
                }
            }
        }
        info!(ticks, "merge stage stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_is_capped_by_max_delay() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(100), Duration::from_millis(250));
        assert!(d.deadline().is_none());
        d.record(t0);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(100)));
        d.record(t0 + Duration::from_millis(90));
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(190)));
        d.record(t0 + Duration::from_millis(200));
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(250)));
        d.reset();
        assert!(!d.is_pending());
    }

    #[test]
    fn default_views_are_not_primed() {
        assert!(!ResourceViews::default().is_primed());
    }
}
