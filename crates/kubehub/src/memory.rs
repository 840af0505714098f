//! In-process document store.
//!
//! Used for local development (`store.type: memory`, optionally seeded from a YAML
//! file) and as the collaborator in tests. Writes and feed notifications happen
//! under one lock so every subscriber sees the collection's changes in commit order.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use crate::{Document, DocumentStore, FeedEvent, FeedStream, StoreError};

const DEFAULT_FEED_CAP: usize = 1024;

struct Collection {
    docs: BTreeMap<String, serde_json::Value>,
    feed: broadcast::Sender<FeedEvent>,
    failure: Option<String>,
}

impl Collection {
    fn new(cap: usize) -> Self {
        let (feed, _) = broadcast::channel(cap);
        Self { docs: BTreeMap::new(), feed, failure: None }
    }
}

pub struct MemoryStore {
    collections: RwLock<FxHashMap<String, Collection>>,
    feed_cap: usize,
    pre_images: bool,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self { Self::with_feed_capacity(DEFAULT_FEED_CAP) }

    /// Feed subscribers lagging more than `cap` events behind lose their cursor.
    pub fn with_feed_capacity(cap: usize) -> Self {
        Self { collections: RwLock::new(FxHashMap::default()), feed_cap: cap.max(1), pre_images: true }
    }

    /// Emit deletes without pre-images, like stores that only report the key.
    pub fn without_pre_images(mut self) -> Self {
        self.pre_images = false;
        self
    }

    /// Insert or replace a document, notifying feed subscribers.
    pub fn put(&self, collection: &str, id: &str, body: serde_json::Value) {
        let mut guard = self.collections.write();
        let coll = guard.entry(collection.to_string()).or_insert_with(|| Collection::new(self.feed_cap));
        let ev = if coll.docs.insert(id.to_string(), body.clone()).is_some() {
            FeedEvent::update(id, body)
        } else {
            FeedEvent::insert(id, body)
        };
        debug!(collection, id, op = ?ev.operation, "memory store write");
        let _ = coll.feed.send(ev);
    }

    /// Remove a document; returns the removed body.
    pub fn delete(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        let mut guard = self.collections.write();
        let coll = guard.get_mut(collection)?;
        let prev = coll.docs.remove(id)?;
        let pre_image = if self.pre_images { Some(prev.clone()) } else { None };
        let _ = coll.feed.send(FeedEvent::delete(id, pre_image));
        Some(prev)
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.collections.read().get(collection).and_then(|c| c.docs.get(id).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.read().get(collection).map(|c| c.docs.len()).unwrap_or(0)
    }

    /// End every open feed on `collection`, as a cursor expiry would.
    pub fn terminate_feeds(&self, collection: &str) {
        let mut guard = self.collections.write();
        if let Some(coll) = guard.get_mut(collection) {
            let (feed, _) = broadcast::channel(self.feed_cap);
            // Dropping the old sender closes every subscriber.
            coll.feed = feed;
            info!(collection, "memory store feeds terminated");
        }
    }

    /// Make every subsequent list/feed call on `collection` fail fatally.
    pub fn fail_collection(&self, collection: &str, reason: &str) {
        {
            let mut guard = self.collections.write();
            let coll = guard.entry(collection.to_string()).or_insert_with(|| Collection::new(self.feed_cap));
            coll.failure = Some(reason.to_string());
        }
        self.terminate_feeds(collection);
    }

    /// Load documents from a YAML file mapping collection names to document lists.
    /// Every document needs a string `id`.
    pub fn seed_from_file(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: BTreeMap<String, Vec<serde_json::Value>> =
            serde_yaml::from_str(&text).with_context(|| format!("parsing seed file {}", path.display()))?;
        let mut count = 0usize;
        for (collection, docs) in seed {
            for doc in docs {
                let id = doc
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("document in {} is missing a string id", collection))?
                    .to_string();
                self.put(&collection, &id, doc);
                count += 1;
            }
        }
        info!(path = %path.display(), count, "memory store seeded");
        Ok(count)
    }

    fn check(&self, collection: &str) -> Result<(), StoreError> {
        match self.collections.read().get(collection).and_then(|c| c.failure.clone()) {
            Some(reason) => Err(StoreError::Fatal(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str { "memory" }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.check(collection)?;
        let guard = self.collections.read();
        Ok(guard
            .get(collection)
            .map(|c| c.docs.iter().map(|(id, body)| Document { id: id.clone(), body: body.clone() }).collect())
            .unwrap_or_default())
    }

    async fn open_feed(&self, collection: &str) -> Result<FeedStream, StoreError> {
        self.check(collection)?;
        let rx = {
            let mut guard = self.collections.write();
            let coll = guard.entry(collection.to_string()).or_insert_with(|| Collection::new(self.feed_cap));
            coll.feed.subscribe()
        };
        let stream = BroadcastStream::new(rx).map(|item| {
            item.map_err(|e: BroadcastStreamRecvError| {
                StoreError::Transient(format!("feed subscriber {}; cursor invalidated", e))
            })
        });
        Ok(stream.boxed())
    }
}
