//! Snapshot publication: lock-free current pointer plus one-shot invalidation signals.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

use crate::merge::ResourceViews;
use crate::snapshot::{BuildError, ConfigurationSnapshot, SnapshotBuilder};

/// One-shot notification that a snapshot has been superseded.
#[derive(Debug, Clone)]
pub struct InvalidationSignal {
    rx: watch::Receiver<bool>,
}

impl InvalidationSignal {
    fn new(rx: watch::Receiver<bool>) -> Self { Self { rx } }

    /// A signal nobody will ever fire; carried by snapshots that are never published.
    pub(crate) fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_invalidated(&self) -> bool { *self.rx.borrow() }

    /// Resolves `true` once the snapshot is superseded, or `false` if that can no
    /// longer happen because the publisher is gone.
    pub async fn invalidated(&self) -> bool {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|v| *v).await.is_ok();
        fired
    }
}

/// Reader handle: lock-free access to the current snapshot plus version notifications.
#[derive(Clone)]
pub struct SnapshotHandle {
    current: Arc<ArcSwap<ConfigurationSnapshot>>,
    version_rx: watch::Receiver<u64>,
}

impl SnapshotHandle {
    pub fn current(&self) -> Arc<ConfigurationSnapshot> { self.current.load_full() }
    pub fn subscribe_version(&self) -> watch::Receiver<u64> { self.version_rx.clone() }
}

struct WriteState {
    builder: SnapshotBuilder,
    /// Fires the current snapshot's invalidation signal.
    signal: watch::Sender<bool>,
    version: u64,
}

/// Owns the current-snapshot pointer. Only `publish` writes it.
pub struct SnapshotPublisher {
    current: Arc<ArcSwap<ConfigurationSnapshot>>,
    write: Mutex<WriteState>,
    version_tx: watch::Sender<u64>,
    version_rx: watch::Receiver<u64>,
}

impl Default for SnapshotPublisher {
    fn default() -> Self { Self::new() }
}

impl SnapshotPublisher {
    /// Starts with an empty snapshot at version 0.
    pub fn new() -> Self {
        let (signal, signal_rx) = watch::channel(false);
        let initial = ConfigurationSnapshot::empty(0).with_invalidation(InvalidationSignal::new(signal_rx));
        let (version_tx, version_rx) = watch::channel(0u64);
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
            write: Mutex::new(WriteState { builder: SnapshotBuilder::new(), signal, version: 0 }),
            version_tx,
            version_rx,
        }
    }

    pub fn handle(&self) -> SnapshotHandle {
        SnapshotHandle { current: Arc::clone(&self.current), version_rx: self.version_rx.clone() }
    }

    pub fn current(&self) -> Arc<ConfigurationSnapshot> { self.current.load_full() }

    /// Build a snapshot from `views`, install it, then fire the previous snapshot's
    /// signal. On a build failure nothing changes and the error is returned.
    pub fn publish(&self, views: &ResourceViews) -> Result<Arc<ConfigurationSnapshot>, BuildError> {
        let mut w = self.write.lock();
        let version = w.version + 1;
        let t0 = Instant::now();
        let built = match w.builder.build(views, version) {
            Ok(s) => s,
            Err(e) => {
                metrics::counter!("snapshot_build_failures_total", 1);
                error!(version, error = %e, "snapshot build failed; keeping previous snapshot");
                return Err(e);
            }
        };
        let (signal, signal_rx) = watch::channel(false);
        let next = Arc::new(built.with_invalidation(InvalidationSignal::new(signal_rx)));
        self.current.store(Arc::clone(&next));
        let previous = std::mem::replace(&mut w.signal, signal);
        previous.send_replace(true);
        w.version = version;
        self.version_tx.send_replace(version);

        let took = t0.elapsed();
        metrics::histogram!("snapshot_build_seconds", took.as_secs_f64());
        metrics::gauge!("snapshot_version", version as f64);
        info!(version, routes = next.routes.len(), clusters = next.clusters.len(), took_ms = %took.as_millis(), "snapshot published");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Route;

    fn primed(routes: Vec<Route>) -> ResourceViews {
        ResourceViews { routes: Arc::new(routes.into_iter().collect()), ..Default::default() }
    }

    #[test]
    fn initial_snapshot_is_empty_version_zero() {
        let p = SnapshotPublisher::new();
        let s = p.current();
        assert_eq!(s.version, 0);
        assert!(s.routes.is_empty());
        assert!(!s.invalidation().is_invalidated());
    }

    #[tokio::test]
    async fn previous_signal_fires_after_install() {
        let p = SnapshotPublisher::new();
        let handle = p.handle();
        let first = handle.current();
        let signal = first.invalidation();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let fired = signal.invalidated().await;
                (fired, handle.current().version)
            })
        };
        p.publish(&primed(vec![Route::new("r1", None)])).unwrap();
        let (fired, seen) = waiter.await.unwrap();
        assert!(fired);
        assert_eq!(seen, 1);
        assert!(!handle.current().invalidation().is_invalidated());
        assert_eq!(*handle.subscribe_version().borrow(), 1);
    }

    #[test]
    fn failed_build_keeps_previous_snapshot_and_signal() {
        let p = SnapshotPublisher::new();
        p.publish(&primed(vec![Route::new("ok", None)])).unwrap();
        let before = p.current();
        assert!(p.publish(&primed(vec![Route::new("bad", None).with_path("/{")])).is_err());
        let after = p.current();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(!after.invalidation().is_invalidated());
        // The failed attempt does not consume a version.
        assert_eq!(p.publish(&primed(vec![])).unwrap().version, 2);
        assert!(after.invalidation().is_invalidated());
    }

    #[tokio::test]
    async fn detached_signal_reports_publisher_gone() {
        let s = InvalidationSignal::detached();
        assert!(!s.invalidated().await);
    }
}
