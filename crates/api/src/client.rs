//! Remote side of the change service: an HTTP client and a `DocumentStore` built on it.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use gantry_core::Resource;
use gantry_kubehub::{Document, DocumentStore, FeedEvent, FeedStream, StoreError};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{EventType, ListResponse, WatchFrame, WatchResponse};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("change service unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    /// The server ended the watch; re-list before watching again.
    #[error("watch terminated: {0}")]
    Terminated(String),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<ClientError> for StoreError {
    fn from(e: ClientError) -> Self {
        match &e {
            ClientError::Status { status: 401 | 403 | 404, .. } => StoreError::Fatal(e.to_string()),
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

pub type WatchStream<R> = BoxStream<'static, Result<WatchResponse<R>, ClientError>>;

#[derive(Deserialize)]
struct ErrorBody {
    error_message: String,
}

#[derive(Clone)]
pub struct ChangeServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl ChangeServiceClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().connect_timeout(Duration::from_secs(5)).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    pub async fn list<T: Resource>(&self) -> Result<Vec<T>, ClientError> {
        self.list_collection(T::KIND.collection()).await
    }

    pub async fn watch<T: Resource>(&self) -> Result<WatchStream<T>, ClientError> {
        self.watch_collection(T::KIND.collection()).await
    }

    pub async fn list_collection<R: DeserializeOwned>(&self, collection: &str) -> Result<Vec<R>, ClientError> {
        let url = format!("{}/v1/{}", self.base_url, collection);
        let resp = check(self.client.get(&url).send().await?).await?;
        Ok(resp.json::<ListResponse<R>>().await?.items)
    }

    /// Open a watch. The stream yields deltas until the server ends it; the last
    /// item is then always an error, `Terminated` for an orderly close.
    pub async fn watch_collection<R>(&self, collection: &str) -> Result<WatchStream<R>, ClientError>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let url = format!("{}/v1/{}/watch", self.base_url, collection);
        let resp = check(self.client.get(&url).send().await?).await?;
        debug!(%url, "watch opened");
        let reader = FrameReader::<R> { body: resp.bytes_stream().boxed(), buf: Vec::new(), done: false, _marker: PhantomData };
        Ok(futures::stream::unfold(reader, |mut r| async move { r.next().await.map(|item| (item, r)) }).boxed())
    }

    /// `true` once every upstream feed of the service is live.
    pub async fn is_ready(&self) -> Result<bool, ClientError> {
        let resp = self.client.get(format!("{}/readyz", self.base_url)).send().await?;
        Ok(resp.status().is_success())
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error_message,
        Err(_) => status.to_string(),
    };
    if status == StatusCode::SERVICE_UNAVAILABLE {
        Err(ClientError::Unavailable(message))
    } else {
        Err(ClientError::Status { status: status.as_u16(), message })
    }
}

/// Splits a chunked NDJSON body into watch frames.
struct FrameReader<R> {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
    done: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> FrameReader<R> {
    async fn next(&mut self) -> Option<Result<WatchResponse<R>, ClientError>> {
        loop {
            if self.done {
                return None;
            }
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..pos];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(match serde_json::from_slice::<WatchFrame<R>>(line) {
                    Ok(WatchFrame::Event(ev)) => Ok(ev),
                    Ok(WatchFrame::Error { message }) => {
                        self.done = true;
                        Err(ClientError::Terminated(message))
                    }
                    Err(e) => {
                        self.done = true;
                        Err(ClientError::Decode(e))
                    }
                });
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(ClientError::Http(e)));
                }
                None => {
                    self.done = true;
                    return Some(Err(ClientError::Terminated("stream closed without a terminal frame".into())));
                }
            }
        }
    }
}

/// A `DocumentStore` backed by a remote change service. Every (re)opened feed is a
/// fresh watch, and the adapter re-lists after each one, as the wire contract requires.
pub struct RemoteStore {
    client: ChangeServiceClient,
}

impl RemoteStore {
    pub fn new(client: ChangeServiceClient) -> Self {
        info!(server = %client.base_url(), "remote store configured");
        Self { client }
    }
}

fn document_id(body: &serde_json::Value) -> Option<String> {
    body.get("id").and_then(|v| v.as_str()).map(str::to_string)
}

fn feed_event(collection: &str, ev: WatchResponse<serde_json::Value>) -> Option<FeedEvent> {
    let Some(id) = document_id(&ev.resource) else {
        warn!(collection, "dropping watch event without an id");
        return None;
    };
    match ev.event_type {
        EventType::Create => Some(FeedEvent::insert(id, ev.resource)),
        EventType::Update => Some(FeedEvent::update(id, ev.resource)),
        EventType::Delete => Some(FeedEvent::delete(id, Some(ev.resource))),
        EventType::Unknown => {
            debug!(collection, id = %id, "skipping watch event of unknown type");
            None
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for RemoteStore {
    fn name(&self) -> &'static str { "remote" }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let items = self.client.list_collection::<serde_json::Value>(collection).await?;
        Ok(items
            .into_iter()
            .filter_map(|body| match document_id(&body) {
                Some(id) => Some(Document { id, body }),
                None => {
                    warn!(collection, "dropping listed item without an id");
                    None
                }
            })
            .collect())
    }

    async fn open_feed(&self, collection: &str) -> Result<FeedStream, StoreError> {
        let stream = self.client.watch_collection::<serde_json::Value>(collection).await?;
        let collection = collection.to_string();
        let mapped = stream.filter_map(move |item| {
            let out = match item {
                Ok(ev) => feed_event(&collection, ev).map(Ok),
                Err(e) => Some(Err(StoreError::from(e))),
            };
            futures::future::ready(out)
        });
        Ok(mapped.boxed())
    }
}
