//! Per-kind change hub: one adapter + accumulator pair fanned out to any number of watchers.

use std::sync::Arc;

use futures::Stream;
use gantry_core::{ChangeEvent, Resource, ResourceKind};
use gantry_kubehub::{spawn_change_feed, DocumentStore, FeedConfig, FeedError, FeedHealth};
use gantry_store::{Accumulator, ViewChange};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ApiError, ApiResult, EventType, WatchResponse};

enum HubMessage<T> {
    Event(WatchResponse<T>),
    /// Ends every subscription that receives it.
    Closed(String),
}

struct HubState<T> {
    acc: Accumulator<T>,
    /// The upstream feed is live: `list` and `watch` are served.
    available: bool,
}

/// Serves `List` and `Watch` for one resource kind.
///
/// Events are applied and broadcast under one lock, so a subscription opened by
/// `watch` observes exactly the deltas that follow the state any later `list`
/// returns. Each subscriber has its own cursor into the broadcast buffer; a
/// subscriber that falls a full buffer behind is ended on its own.
pub struct ChangeHub<T: Resource> {
    state: Mutex<HubState<T>>,
    events: broadcast::Sender<Arc<HubMessage<T>>>,
}

impl<T: Resource> ChangeHub<T> {
    pub fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self { state: Mutex::new(HubState { acc: Accumulator::new(), available: false }), events }
    }

    /// Start the adapter for `T` and pump its events into a new hub. The returned
    /// task ends, closing every watcher, once the adapter stops.
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        feed_cfg: FeedConfig,
        health: FeedHealth,
        buffer: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<Result<(), FeedError>>) {
        let hub = Arc::new(Self::new(buffer));
        let (mut rx, feed) = spawn_change_feed::<T>(store, feed_cfg, health, cancel);
        let pump = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    hub.apply(ev);
                }
                let (reason, res) = match feed.await {
                    Ok(Ok(())) => ("change service shutting down".to_string(), Ok(())),
                    Ok(Err(e)) => (e.to_string(), Err(e)),
                    Err(e) => {
                        warn!(kind = %T::KIND, error = %e, "change feed task aborted");
                        ("change feed stopped".to_string(), Ok(()))
                    }
                };
                hub.close(&reason);
                res
            })
        };
        (hub, pump)
    }

    pub fn kind(&self) -> ResourceKind { T::KIND }

    pub fn is_available(&self) -> bool { self.state.lock().available }

    pub fn watcher_count(&self) -> usize { self.events.receiver_count() }

    /// Current resources ordered by id.
    pub fn list(&self) -> ApiResult<Vec<T>> {
        let st = self.state.lock();
        if !st.available {
            return Err(self.unavailable());
        }
        Ok(st.acc.view().sorted().into_iter().cloned().collect())
    }

    /// Subscribe to every delta applied from now on.
    pub fn watch(&self) -> ApiResult<Subscription<T>> {
        let st = self.state.lock();
        if !st.available {
            return Err(self.unavailable());
        }
        let sub = Subscription::new(T::KIND, self.events.subscribe());
        drop(st);
        info!(kind = %T::KIND, watcher = %sub.id, watchers = self.watcher_count(), "watch opened");
        Ok(sub)
    }

    /// Fold one adapter event into the view and fan out the effective changes.
    pub fn apply(&self, event: ChangeEvent<T>) {
        let mut st = self.state.lock();
        match event {
            ChangeEvent::Interrupted => {
                st.acc.apply(ChangeEvent::Interrupted);
                if st.available {
                    st.available = false;
                    self.send(HubMessage::Closed(format!("{} change feed interrupted; re-list required", T::KIND)));
                }
            }
            ChangeEvent::Synced => {
                for change in st.acc.apply(ChangeEvent::Synced) {
                    self.send(HubMessage::Event(response(change)));
                }
                if !st.available {
                    st.available = true;
                    info!(kind = %T::KIND, items = st.acc.view().len(), "change hub available");
                }
            }
            other => {
                for change in st.acc.apply(other) {
                    self.send(HubMessage::Event(response(change)));
                }
            }
        }
    }

    /// Mark the hub unavailable and end every open subscription with `reason`.
    pub fn close(&self, reason: &str) {
        let mut st = self.state.lock();
        st.available = false;
        self.send(HubMessage::Closed(reason.to_string()));
        info!(kind = %T::KIND, reason, "change hub closed");
    }

    fn send(&self, msg: HubMessage<T>) {
        // No subscribers is not an error.
        let _ = self.events.send(Arc::new(msg));
    }

    fn unavailable(&self) -> ApiError {
        ApiError::Unavailable(format!("{} change feed is not live", T::KIND))
    }
}

fn response<T>(change: ViewChange<T>) -> WatchResponse<T> {
    match change {
        ViewChange::Upserted { previous: None, current } => WatchResponse { resource: current, event_type: EventType::Create },
        ViewChange::Upserted { previous: Some(_), current } => {
            WatchResponse { resource: current, event_type: EventType::Update }
        }
        ViewChange::Removed(previous) => WatchResponse { resource: previous, event_type: EventType::Delete },
    }
}

/// One watcher's ordered view of a hub. Ends after yielding one terminal error.
pub struct Subscription<T> {
    id: Uuid,
    kind: ResourceKind,
    rx: broadcast::Receiver<Arc<HubMessage<T>>>,
    done: bool,
}

impl<T: Resource> Subscription<T> {
    fn new(kind: ResourceKind, rx: broadcast::Receiver<Arc<HubMessage<T>>>) -> Self {
        metrics::increment_gauge!("change_service_watchers", 1.0, "kind" => kind.as_str());
        Self { id: Uuid::new_v4(), kind, rx, done: false }
    }

    pub fn id(&self) -> Uuid { self.id }

    pub async fn next(&mut self) -> Option<ApiResult<WatchResponse<T>>> {
        if self.done {
            return None;
        }
        let item = match self.rx.recv().await {
            Ok(msg) => match &*msg {
                HubMessage::Event(ev) => return Some(Ok(ev.clone())),
                HubMessage::Closed(reason) => ApiError::Terminated(reason.clone()),
            },
            Err(RecvError::Lagged(missed)) => {
                metrics::counter!("change_service_lagged_total", 1, "kind" => self.kind.as_str());
                warn!(kind = %self.kind, watcher = %self.id, missed, "watcher fell behind");
                ApiError::Terminated(format!("watcher fell behind by {} events; re-list required", missed))
            }
            Err(RecvError::Closed) => ApiError::Terminated("change service shutting down".into()),
        };
        self.done = true;
        Some(Err(item))
    }

    pub fn into_stream(self) -> impl Stream<Item = ApiResult<WatchResponse<T>>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move { sub.next().await.map(|item| (item, sub)) })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        metrics::decrement_gauge!("change_service_watchers", 1.0, "kind" => self.kind.as_str());
        debug!(kind = %self.kind, watcher = %self.id, "watch closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Route;

    fn live_hub(buffer: usize) -> ChangeHub<Route> {
        let hub = ChangeHub::new(buffer);
        hub.apply(ChangeEvent::Listed(Route::new("a", None)));
        hub.apply(ChangeEvent::Synced);
        hub
    }

    #[test]
    fn unavailable_until_synced() {
        let hub = ChangeHub::<Route>::new(8);
        hub.apply(ChangeEvent::Listed(Route::new("a", None)));
        assert!(matches!(hub.list(), Err(ApiError::Unavailable(_))));
        assert!(hub.watch().is_err());
        hub.apply(ChangeEvent::Synced);
        assert_eq!(hub.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watchers_receive_effective_deltas_in_order() {
        let hub = live_hub(8);
        let mut w = hub.watch().unwrap();
        hub.apply(ChangeEvent::Created(Route::new("b", None)));
        hub.apply(ChangeEvent::Updated(Route::new("b", None)));
        hub.apply(ChangeEvent::Updated(Route::new("b", Some("c1"))));
        hub.apply(ChangeEvent::Deleted { id: "a".into(), previous: None });

        let kinds: Vec<_> = [w.next().await, w.next().await, w.next().await]
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .map(|ev| (ev.event_type, ev.resource.id.to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (EventType::Create, "b".to_string()),
                (EventType::Update, "b".to_string()),
                (EventType::Delete, "a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn interruption_ends_watchers_and_blocks_new_ones_until_relisted() {
        let hub = live_hub(8);
        let mut w = hub.watch().unwrap();
        hub.apply(ChangeEvent::Interrupted);
        assert!(matches!(w.next().await, Some(Err(ApiError::Terminated(_)))));
        assert!(w.next().await.is_none());
        assert!(hub.watch().is_err());

        hub.apply(ChangeEvent::Listed(Route::new("z", None)));
        hub.apply(ChangeEvent::Synced);
        let ids: Vec<_> = hub.list().unwrap().into_iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["z"]);
    }

    #[tokio::test]
    async fn lagging_watcher_ends_alone() {
        let hub = live_hub(2);
        let mut slow = hub.watch().unwrap();
        let mut fast = hub.watch().unwrap();
        for i in 0..5 {
            hub.apply(ChangeEvent::Created(Route::new(format!("r{}", i), None)));
            assert_eq!(fast.next().await.unwrap().unwrap().resource.id.to_string(), format!("r{}", i));
        }
        assert!(matches!(slow.next().await, Some(Err(ApiError::Terminated(m))) if m.contains("fell behind")));
        hub.apply(ChangeEvent::Created(Route::new("after", None)));
        assert_eq!(fast.next().await.unwrap().unwrap().resource.id.as_str(), "after");
    }
}
