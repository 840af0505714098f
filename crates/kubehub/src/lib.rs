//! Gantry kubehub: document stores and the per-kind change-feed adapter.
//!
//! A [`DocumentStore`] offers two primitives per collection: a full listing and a
//! change-feed subscription that may terminate at any time. [`ChangeFeed`] turns
//! those into an ordered, typed [`gantry_core::ChangeEvent`] stream that survives
//! feed termination by reopening and relisting.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod feed;
mod health;
pub mod kube_store;
pub mod memory;

pub use feed::{decode_document, spawn_change_feed, Backoff, ChangeFeed, FeedConfig, FeedError};
pub use health::{FeedHealth, FeedState};
pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// A stored document: its key and raw JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One change-feed notification as delivered by the store, in collection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub operation: Operation,
    pub document_id: String,
    pub post_image: Option<serde_json::Value>,
    /// Required by the contract for deletes, but not every backend can supply it.
    pub pre_image: Option<serde_json::Value>,
}

impl FeedEvent {
    pub fn insert(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self { operation: Operation::Insert, document_id: id.into(), post_image: Some(body), pre_image: None }
    }

    pub fn update(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self { operation: Operation::Update, document_id: id.into(), post_image: Some(body), pre_image: None }
    }

    pub fn delete(id: impl Into<String>, pre_image: Option<serde_json::Value>) -> Self {
        Self { operation: Operation::Delete, document_id: id.into(), post_image: None, pre_image }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Cursor expiry, timeouts, network blips: the feed can be reopened.
    #[error("transient store error: {0}")]
    Transient(String),
    /// Authentication failure, missing collection: retrying will not help.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Transient(_)) }
}

pub type FeedStream = BoxStream<'static, Result<FeedEvent, StoreError>>;

/// Document store collaborator: full listing plus a reopenable change feed per collection.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Open a change feed positioned at "now". The stream ends (or yields an error)
    /// when the store terminates the subscription.
    async fn open_feed(&self, collection: &str) -> Result<FeedStream, StoreError>;
}
