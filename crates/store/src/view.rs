//! Materialized views: one keyed resource set per kind, folded from its change feed.

use std::sync::Arc;

use gantry_core::{ChangeEvent, Resource, ResourceId, ResourceKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Point-in-time set of resources of one kind, keyed by id.
///
/// Feed liveness is tracked by the [`Accumulator`], not here: a reconnect that
/// relists the same content leaves the published `Arc` untouched.
#[derive(Debug, Clone)]
pub struct MaterializedView<T> {
    entries: FxHashMap<ResourceId, T>,
    primed: bool,
}

impl<T> Default for MaterializedView<T> {
    fn default() -> Self { Self { entries: FxHashMap::default(), primed: false } }
}

impl<T: Resource> MaterializedView<T> {
    pub fn get(&self, id: &str) -> Option<&T> { self.entries.get(id) }
    pub fn contains(&self, id: &str) -> bool { self.entries.contains_key(id) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// The first full listing has been folded in.
    pub fn is_primed(&self) -> bool { self.primed }

    pub fn iter(&self) -> impl Iterator<Item = &T> { self.entries.values() }

    /// Entries ordered by id.
    pub fn sorted(&self) -> Vec<&T> {
        let mut out: Vec<&T> = self.entries.values().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }
}

impl<T: Resource> FromIterator<T> for MaterializedView<T> {
    /// A primed view holding `iter`; later duplicates win.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|r| (r.id().clone(), r)).collect();
        Self { entries, primed: true }
    }
}

/// Effective change to a view caused by one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange<T> {
    Upserted { previous: Option<T>, current: T },
    Removed(T),
}

/// Folds an ordered `ChangeEvent<T>` stream into a [`MaterializedView`].
///
/// Upserts never fail: `Updated` for an unseen id inserts, `Deleted` for an unseen
/// id is a no-op. A `Listed` burst closed by `Synced` is authoritative, so ids that
/// the burst did not mention are pruned at `Synced`.
pub struct Accumulator<T> {
    view: Arc<MaterializedView<T>>,
    /// Ids seen in the currently open listing burst.
    listing: Option<FxHashSet<ResourceId>>,
    live: bool,
}

impl<T: Resource> Default for Accumulator<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Resource> Accumulator<T> {
    pub fn new() -> Self {
        // A fresh accumulator expects a listing, even an empty one.
        Self { view: Arc::new(MaterializedView::default()), listing: Some(FxHashSet::default()), live: false }
    }

    pub fn view(&self) -> &MaterializedView<T> { &self.view }

    /// The feed is delivering live deltas (between `Synced` and `Interrupted`).
    pub fn is_live(&self) -> bool { self.live }

    /// Cheap shared copy of the current view; later applies copy-on-write.
    pub fn snapshot(&self) -> Arc<MaterializedView<T>> { Arc::clone(&self.view) }

    pub fn apply(&mut self, event: ChangeEvent<T>) -> Vec<ViewChange<T>> {
        match event {
            ChangeEvent::Listed(resource) => {
                self.listing.get_or_insert_with(FxHashSet::default).insert(resource.id().clone());
                self.upsert(resource).into_iter().collect()
            }
            ChangeEvent::Created(resource) | ChangeEvent::Updated(resource) => self.upsert(resource).into_iter().collect(),
            ChangeEvent::Deleted { id, .. } => self.remove(&id).into_iter().collect(),
            ChangeEvent::Synced => {
                let mut changes = Vec::new();
                if let Some(seen) = self.listing.take() {
                    let stale: Vec<ResourceId> =
                        self.view.entries.keys().filter(|id| !seen.contains(*id)).cloned().collect();
                    if !stale.is_empty() {
                        debug!(kind = %T::KIND, pruned = stale.len(), "pruning entries missing from listing");
                    }
                    for id in stale {
                        changes.extend(self.remove(&id));
                    }
                }
                if !self.view.primed {
                    Arc::make_mut(&mut self.view).primed = true;
                }
                self.live = true;
                changes
            }
            ChangeEvent::Interrupted => {
                self.listing = Some(FxHashSet::default());
                self.live = false;
                Vec::new()
            }
        }
    }

    fn upsert(&mut self, resource: T) -> Option<ViewChange<T>> {
        if self.view.entries.get(resource.id()) == Some(&resource) {
            return None;
        }
        let view = Arc::make_mut(&mut self.view);
        let previous = view.entries.insert(resource.id().clone(), resource.clone());
        Some(ViewChange::Upserted { previous, current: resource })
    }

    fn remove(&mut self, id: &ResourceId) -> Option<ViewChange<T>> {
        if !self.view.entries.contains_key(id) {
            return None;
        }
        Arc::make_mut(&mut self.view).entries.remove(id).map(ViewChange::Removed)
    }
}

/// Run an accumulator over `events`, publishing each settled view on the returned
/// watch channel and pinging `notify` with the kind whenever its content changes.
/// Reconnects that relist identical content publish nothing.
pub fn spawn_accumulator<T: Resource>(
    mut events: mpsc::Receiver<ChangeEvent<T>>,
    notify: mpsc::Sender<ResourceKind>,
) -> (watch::Receiver<Arc<MaterializedView<T>>>, JoinHandle<()>) {
    let (view_tx, view_rx) = watch::channel(Arc::new(MaterializedView::<T>::default()));
    let handle = tokio::spawn(async move {
        let kind = T::KIND;
        let mut acc = Accumulator::<T>::new();
        while let Some(first) = events.recv().await {
            let was_primed = acc.view().is_primed();
            let mut changed = !acc.apply(first).is_empty();
            // Fold whatever is already queued before publishing.
            while let Ok(next) = events.try_recv() {
                changed |= !acc.apply(next).is_empty();
            }
            changed |= was_primed != acc.view().is_primed();
            if !changed {
                continue;
            }
            metrics::gauge!("view_entries", acc.view().len() as f64, "kind" => kind.as_str());
            view_tx.send_replace(acc.snapshot());
            // A full queue already holds a pending ping.
            let _ = notify.try_send(kind);
        }
        info!(%kind, "accumulator stopped");
    });
    (view_rx, handle)
}
