//! In-process [`DocumentStore`] over a running [`ChangeService`].
//!
//! `gantryctl serve` feeds its snapshot pipeline from the same hubs it exposes over
//! HTTP, so each collection has exactly one store subscription and one accumulator
//! behind both the local snapshots and what remote watchers list.

use futures::StreamExt;
use gantry_core::{
    AuthenticationPolicy, Certificate, Cluster, Middleware, Resource, ResourceKind, Route, ServiceDiscovery,
};
use gantry_kubehub::{Document, DocumentStore, FeedEvent, FeedStream, StoreError};
use tracing::warn;

use crate::{ApiError, ChangeHub, ChangeService, EventType, WatchResponse};

impl From<ApiError> for StoreError {
    fn from(e: ApiError) -> Self {
        // Both end states are recovered by re-listing.
        StoreError::Transient(e.to_string())
    }
}

/// Reads the hubs of a [`ChangeService`] in the same process.
#[derive(Clone)]
pub struct LocalStore {
    service: ChangeService,
}

impl LocalStore {
    pub fn new(service: ChangeService) -> Self { Self { service } }
}

impl ChangeService {
    /// A [`DocumentStore`] backed by this service's hubs.
    pub fn local_store(&self) -> LocalStore { LocalStore::new(self.clone()) }
}

fn document<T: Resource>(resource: &T) -> Result<Document, StoreError> {
    let body = serde_json::to_value(resource)
        .map_err(|e| StoreError::Fatal(format!("encoding {} {}: {}", T::KIND, resource.id(), e)))?;
    Ok(Document { id: resource.id().to_string(), body })
}

fn list_hub<T: Resource>(hub: &ChangeHub<T>) -> Result<Vec<Document>, StoreError> {
    hub.list()?.iter().map(document).collect()
}

fn feed_event<T: Resource>(ev: WatchResponse<T>) -> Option<Result<FeedEvent, StoreError>> {
    let doc = match document(&ev.resource) {
        Ok(doc) => doc,
        Err(e) => return Some(Err(e)),
    };
    match ev.event_type {
        EventType::Create => Some(Ok(FeedEvent::insert(doc.id, doc.body))),
        EventType::Update => Some(Ok(FeedEvent::update(doc.id, doc.body))),
        EventType::Delete => Some(Ok(FeedEvent::delete(doc.id, Some(doc.body)))),
        EventType::Unknown => None,
    }
}

fn watch_hub<T: Resource>(hub: &ChangeHub<T>) -> Result<FeedStream, StoreError> {
    let stream = hub.watch()?.into_stream().filter_map(|item| {
        futures::future::ready(match item {
            Ok(ev) => feed_event(ev),
            Err(e) => Some(Err(StoreError::from(e))),
        })
    });
    Ok(stream.boxed())
}

fn kind_of(collection: &str) -> Result<ResourceKind, StoreError> {
    ResourceKind::ALL.into_iter().find(|k| k.collection() == collection).ok_or_else(|| {
        warn!(collection, "no change hub for collection");
        StoreError::Fatal(format!("unknown collection {}", collection))
    })
}

#[async_trait::async_trait]
impl DocumentStore for LocalStore {
    fn name(&self) -> &'static str { "local" }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let s = &self.service;
        match kind_of(collection)? {
            ResourceKind::Route => list_hub::<Route>(&s.routes),
            ResourceKind::Cluster => list_hub::<Cluster>(&s.clusters),
            ResourceKind::Middleware => list_hub::<Middleware>(&s.middlewares),
            ResourceKind::Certificate => list_hub::<Certificate>(&s.certificates),
            ResourceKind::AuthenticationPolicy => list_hub::<AuthenticationPolicy>(&s.authentication_policies),
            ResourceKind::ServiceDiscovery => list_hub::<ServiceDiscovery>(&s.service_discoveries),
        }
    }

    async fn open_feed(&self, collection: &str) -> Result<FeedStream, StoreError> {
        let s = &self.service;
        match kind_of(collection)? {
            ResourceKind::Route => watch_hub::<Route>(&s.routes),
            ResourceKind::Cluster => watch_hub::<Cluster>(&s.clusters),
            ResourceKind::Middleware => watch_hub::<Middleware>(&s.middlewares),
            ResourceKind::Certificate => watch_hub::<Certificate>(&s.certificates),
            ResourceKind::AuthenticationPolicy => watch_hub::<AuthenticationPolicy>(&s.authentication_policies),
            ResourceKind::ServiceDiscovery => watch_hub::<ServiceDiscovery>(&s.service_discoveries),
        }
    }
}
