//! Per-kind change-feed adapter.
//!
//! Each session opens the store's feed first and lists second, so no change made
//! while listing is lost: feed events that predate the listing are replayed on top
//! of it and converge to the same final state. A session ends when the feed
//! terminates; the adapter then emits `Interrupted`, backs off and starts over.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use gantry_core::{ChangeEvent, Resource, ResourceId, ResourceKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{DocumentStore, FeedEvent, FeedHealth, FeedState, Operation, StoreError};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Capacity of the adapter's output channel.
    pub queue_cap: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { backoff_base: Duration::from_millis(250), backoff_max: Duration::from_secs(30), queue_cap: 1024 }
    }
}

/// Exponential backoff capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max, attempt: 0 } }

    pub fn attempt(&self) -> u32 { self.attempt }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) { self.attempt = 0; }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("{kind} change feed failed: {reason}")]
    Fatal { kind: ResourceKind, reason: String },
}

enum SessionEnd {
    /// The store ended the feed or reported a transient error.
    Terminated(Option<StoreError>),
    Cancelled,
    ReceiverGone,
}

/// Adapter turning one collection's store feed into `ChangeEvent<T>`s.
pub struct ChangeFeed<T> {
    store: Arc<dyn DocumentStore>,
    config: FeedConfig,
    health: FeedHealth,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> ChangeFeed<T> {
    pub fn new(store: Arc<dyn DocumentStore>, config: FeedConfig, health: FeedHealth) -> Self {
        Self { store, config, health, _marker: PhantomData }
    }

    /// Run until cancelled, the receiver is dropped, or the store fails fatally.
    pub async fn run(self, tx: mpsc::Sender<ChangeEvent<T>>, cancel: CancellationToken) -> Result<(), FeedError> {
        let kind = T::KIND;
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        self.health.set(kind, FeedState::Starting);
        info!(%kind, store = self.store.name(), "change feed starting");
        loop {
            let mut live = false;
            let end = match self.session(&tx, &cancel, &mut live).await {
                Ok(end) => end,
                Err(StoreError::Fatal(reason)) => {
                    error!(%kind, reason = %reason, "change feed failed");
                    metrics::counter!("feed_fatal_errors_total", 1, "kind" => kind.as_str());
                    if live {
                        let _ = tx.send(ChangeEvent::Interrupted).await;
                    }
                    self.health.set(kind, FeedState::Failed { reason: reason.clone() });
                    return Err(FeedError::Fatal { kind, reason });
                }
                Err(transient) => SessionEnd::Terminated(Some(transient)),
            };
            match end {
                SessionEnd::Cancelled => {
                    debug!(%kind, "change feed cancelled");
                    return Ok(());
                }
                SessionEnd::ReceiverGone => {
                    debug!(%kind, "change feed receiver dropped");
                    return Ok(());
                }
                SessionEnd::Terminated(cause) => {
                    if live {
                        backoff.reset();
                        if tx.send(ChangeEvent::Interrupted).await.is_err() {
                            return Ok(());
                        }
                    }
                    match cause {
                        Some(e) => warn!(%kind, error = %e, "change feed interrupted; resubscribing"),
                        None => info!(%kind, "change feed ended; resubscribing"),
                    }
                }
            }
            let delay = backoff.next_delay();
            self.health.set(kind, FeedState::Reconnecting { attempt: backoff.attempt() });
            metrics::counter!("feed_reconnects_total", 1, "kind" => kind.as_str());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<ChangeEvent<T>>,
        cancel: &CancellationToken,
        live: &mut bool,
    ) -> Result<SessionEnd, StoreError> {
        let kind = T::KIND;
        let collection = kind.collection();
        let t0 = Instant::now();
        let mut feed = self.store.open_feed(collection).await?;
        let docs = self.store.list(collection).await?;
        let listed = docs.len();
        for doc in docs {
            if let Some(resource) = decode_document::<T>(&doc.id, doc.body) {
                if let Some(end) = emit(tx, cancel, ChangeEvent::Listed(resource)).await {
                    return Ok(end);
                }
            }
        }
        self.health.set(kind, FeedState::Live);
        if let Some(end) = emit(tx, cancel, ChangeEvent::Synced).await {
            return Ok(end);
        }
        *live = true;
        info!(%kind, listed, took_ms = %t0.elapsed().as_millis(), "change feed live");

        loop {
            let next = tokio::select! {
                next = feed.next() => next,
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            };
            match next {
                None => return Ok(SessionEnd::Terminated(None)),
                Some(Err(StoreError::Transient(reason))) => {
                    return Ok(SessionEnd::Terminated(Some(StoreError::Transient(reason))))
                }
                Some(Err(fatal)) => return Err(fatal),
                Some(Ok(ev)) => {
                    if let Some(change) = translate::<T>(ev) {
                        metrics::counter!("feed_events_total", 1, "kind" => kind.as_str());
                        if let Some(end) = emit(tx, cancel, change).await {
                            return Ok(end);
                        }
                    }
                }
            }
        }
    }
}

/// Spawn an adapter task for `T`. The receiver yields the ordered event stream.
pub fn spawn_change_feed<T: Resource>(
    store: Arc<dyn DocumentStore>,
    config: FeedConfig,
    health: FeedHealth,
    cancel: CancellationToken,
) -> (mpsc::Receiver<ChangeEvent<T>>, JoinHandle<Result<(), FeedError>>) {
    let (tx, rx) = mpsc::channel(config.queue_cap.max(1));
    let feed = ChangeFeed::<T>::new(store, config, health);
    let handle = tokio::spawn(feed.run(tx, cancel));
    (rx, handle)
}

async fn emit<T>(tx: &mpsc::Sender<ChangeEvent<T>>, cancel: &CancellationToken, ev: ChangeEvent<T>) -> Option<SessionEnd> {
    tokio::select! {
        res = tx.send(ev) => res.err().map(|_| SessionEnd::ReceiverGone),
        _ = cancel.cancelled() => Some(SessionEnd::Cancelled),
    }
}

/// Parse a document body into `T`. The store key is authoritative for the id.
pub fn decode_document<T: Resource>(doc_id: &str, mut body: serde_json::Value) -> Option<T> {
    let kind = T::KIND;
    match body.as_object_mut() {
        Some(obj) => {
            obj.insert("id".to_string(), serde_json::Value::String(doc_id.to_string()));
        }
        None => {
            warn!(%kind, id = doc_id, "dropping malformed document: body is not an object");
            metrics::counter!("feed_malformed_total", 1, "kind" => kind.as_str());
            return None;
        }
    }
    match serde_json::from_value::<T>(body) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(%kind, id = doc_id, error = %e, "dropping malformed document");
            metrics::counter!("feed_malformed_total", 1, "kind" => kind.as_str());
            None
        }
    }
}

fn translate<T: Resource>(ev: FeedEvent) -> Option<ChangeEvent<T>> {
    match ev.operation {
        Operation::Insert | Operation::Update => {
            let Some(body) = ev.post_image else {
                warn!(kind = %T::KIND, id = %ev.document_id, "dropping feed event without post-image");
                metrics::counter!("feed_malformed_total", 1, "kind" => T::KIND.as_str());
                return None;
            };
            let resource = decode_document::<T>(&ev.document_id, body)?;
            Some(if ev.operation == Operation::Insert {
                ChangeEvent::Created(resource)
            } else {
                ChangeEvent::Updated(resource)
            })
        }
        Operation::Delete => {
            let previous = ev.pre_image.and_then(|body| decode_document::<T>(&ev.document_id, body));
            Some(ChangeEvent::Deleted { id: ResourceId::new(ev.document_id), previous })
        }
    }
}
