//! Kubernetes-backed document store.
//!
//! Every collection is a custom resource (`<group>/<version>`, kind from
//! [`ResourceKind::kube_kind`]); the object's `spec` is the document body and
//! `metadata.name` its id. Without a configured namespace every namespace is
//! watched and ids become `<namespace>/<name>`, so references across namespaces
//! must use that form too.

use std::str::FromStr;

use anyhow::{Context, Result};
use futures::StreamExt;
use gantry_core::ResourceKind;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::{debug, info};

use crate::{Document, DocumentStore, FeedEvent, FeedStream, StoreError};

pub const DEFAULT_GROUP: &str = "gateway.gantry.dev";
pub const DEFAULT_VERSION: &str = "v1";

/// Server-side watch timeout; the feed ends after this and is reopened.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
    group: String,
    version: String,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>, group: &str, version: &str) -> Self {
        Self { client, namespace, group: group.to_string(), version: version.to_string() }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(namespace: Option<String>, group: &str, version: &str) -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        info!(group, version, ns = ?namespace, "kube store connected");
        Ok(Self::new(client, namespace, group, version))
    }

    /// Ids need the namespace when objects from several namespaces share a collection.
    fn qualify_ids(&self) -> bool { self.namespace.is_none() }

    fn api(&self, collection: &str) -> Result<Api<DynamicObject>, StoreError> {
        let kind = ResourceKind::from_str(collection).map_err(|e| StoreError::Fatal(e.to_string()))?;
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, kind.kube_kind());
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.collection());
        Ok(match self.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => classify_code(resp.code, resp.message),
        other => StoreError::Transient(other.to_string()),
    }
}

fn classify_code(code: u16, message: String) -> StoreError {
    match code {
        401 | 403 | 404 => StoreError::Fatal(format!("{}: {}", code, message)),
        _ => StoreError::Transient(format!("{}: {}", code, message)),
    }
}

fn document_id(obj: &DynamicObject, qualify: bool) -> Option<String> {
    let name = obj.metadata.name.as_deref()?;
    Some(match obj.metadata.namespace.as_deref() {
        Some(ns) if qualify => format!("{}/{}", ns, name),
        _ => name.to_string(),
    })
}

fn document_from(obj: &DynamicObject, qualify: bool) -> Option<Document> {
    let id = document_id(obj, qualify)?;
    let body = obj.data.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    Some(Document { id, body })
}

#[async_trait::async_trait]
impl DocumentStore for KubeStore {
    fn name(&self) -> &'static str { "kubernetes" }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let api = self.api(collection)?;
        let list = api.list(&ListParams::default()).await.map_err(classify)?;
        debug!(collection, count = list.items.len(), "kube list");
        let qualify = self.qualify_ids();
        Ok(list.items.iter().filter_map(|o| document_from(o, qualify)).collect())
    }

    async fn open_feed(&self, collection: &str) -> Result<FeedStream, StoreError> {
        let api = self.api(collection)?;
        // "0" or an unset version would replay the collection as synthetic `Added`
        // events, possibly from a stale cache. Start at the current quorum version;
        // the listing that follows supplies the state.
        let head = api.list(&ListParams::default().limit(1)).await.map_err(classify)?;
        let version = head.metadata.resource_version.unwrap_or_default();
        debug!(collection, %version, "kube watch");
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = api.watch(&wp, &version).await.map_err(classify)?;
        let qualify = self.qualify_ids();
        let mapped = stream.filter_map(move |res| async move {
            match res {
                Ok(WatchEvent::Added(o)) => document_from(&o, qualify).map(|d| Ok(FeedEvent::insert(d.id, d.body))),
                Ok(WatchEvent::Modified(o)) => document_from(&o, qualify).map(|d| Ok(FeedEvent::update(d.id, d.body))),
                Ok(WatchEvent::Deleted(o)) => {
                    document_from(&o, qualify).map(|d| Ok(FeedEvent::delete(d.id, Some(d.body))))
                }
                Ok(WatchEvent::Bookmark(_)) => None,
                // 410 Gone: the resource version expired; reopen and relist.
                Ok(WatchEvent::Error(e)) => Some(Err(classify_code(e.code, e.message))),
                Err(e) => Some(Err(classify(e))),
            }
        });
        Ok(mapped.boxed())
    }
}
