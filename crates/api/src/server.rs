//! HTTP surface of the change service (axum).

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::Stream;
use gantry_core::{
    AuthenticationPolicy, Certificate, Cluster, Middleware, Resource, ResourceKind, Route, ServiceDiscovery,
};
use gantry_kubehub::{DocumentStore, FeedConfig, FeedError, FeedHealth, FeedState};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{ApiError, ChangeHub, ListResponse, Subscription, WatchFrame};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Per-kind broadcast buffer; a watcher further behind than this is ended.
    pub watch_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self { Self { host: "127.0.0.1".into(), port: 7400, watch_buffer: 1024 } }
}

impl ServiceConfig {
    pub fn addr(&self) -> String { format!("{}:{}", self.host, self.port) }
}

/// The six change hubs plus the feed health they report into.
#[derive(Clone)]
pub struct ChangeService {
    pub routes: Arc<ChangeHub<Route>>,
    pub clusters: Arc<ChangeHub<Cluster>>,
    pub middlewares: Arc<ChangeHub<Middleware>>,
    pub certificates: Arc<ChangeHub<Certificate>>,
    pub authentication_policies: Arc<ChangeHub<AuthenticationPolicy>>,
    pub service_discoveries: Arc<ChangeHub<ServiceDiscovery>>,
    health: FeedHealth,
}

impl ChangeService {
    /// Start one hub per kind against `store`. The task completes once every hub
    /// has stopped and yields the first fatal feed error.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        feed_cfg: FeedConfig,
        watch_buffer: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<Result<(), FeedError>>) {
        let health = FeedHealth::new();
        for kind in ResourceKind::ALL {
            health.set(kind, FeedState::Starting);
        }
        let mut tasks = Vec::with_capacity(ResourceKind::ALL.len());
        macro_rules! hub {
            ($ty:ty) => {{
                let (hub, task) = ChangeHub::<$ty>::spawn(
                    Arc::clone(&store),
                    feed_cfg.clone(),
                    health.clone(),
                    watch_buffer,
                    cancel.child_token(),
                );
                tasks.push(task);
                hub
            }};
        }
        let service = Self {
            routes: hub!(Route),
            clusters: hub!(Cluster),
            middlewares: hub!(Middleware),
            certificates: hub!(Certificate),
            authentication_policies: hub!(AuthenticationPolicy),
            service_discoveries: hub!(ServiceDiscovery),
            health,
        };
        info!(store = store.name(), watch_buffer, "change service started");
        let join = tokio::spawn(async move {
            let mut first_err = None;
            for task in tasks {
                match task.await {
                    Ok(Err(e)) => {
                        first_err.get_or_insert(e);
                    }
                    Ok(Ok(())) => {}
                    Err(e) => warn!(error = %e, "change hub task aborted"),
                }
            }
            first_err.map_or(Ok(()), Err)
        });
        (service, join)
    }

    pub fn health(&self) -> &FeedHealth { &self.health }

    pub fn router(&self) -> Router {
        Router::new()
            .merge(kind_routes(Arc::clone(&self.routes)))
            .merge(kind_routes(Arc::clone(&self.clusters)))
            .merge(kind_routes(Arc::clone(&self.middlewares)))
            .merge(kind_routes(Arc::clone(&self.certificates)))
            .merge(kind_routes(Arc::clone(&self.authentication_policies)))
            .merge(kind_routes(Arc::clone(&self.service_discoveries)))
            .merge(admin_routes(self.health.clone()))
    }
}

/// `GET /v1/{collection}` and `GET /v1/{collection}/watch` for one kind.
fn kind_routes<T: Resource>(hub: Arc<ChangeHub<T>>) -> Router {
    let base = format!("/v1/{}", T::KIND.collection());
    Router::new()
        .route(&base, get(list::<T>))
        .route(&format!("{}/watch", base), get(watch::<T>))
        .with_state(hub)
}

fn admin_routes(health: FeedHealth) -> Router {
    Router::new().route("/healthz", get(healthz)).route("/readyz", get(readyz)).with_state(health)
}

async fn list<T: Resource>(State(hub): State<Arc<ChangeHub<T>>>) -> Result<Json<ListResponse<T>>, ApiError> {
    let items = hub.list()?;
    metrics::counter!("change_service_lists_total", 1, "kind" => T::KIND.as_str());
    Ok(Json(ListResponse { items }))
}

async fn watch<T: Resource>(State(hub): State<Arc<ChangeHub<T>>>) -> Result<Response, ApiError> {
    let sub = hub.watch()?;
    let body = Body::from_stream(ndjson(sub));
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

/// Encode a subscription as newline-delimited frames, closing with one error frame.
fn ndjson<T: Resource>(sub: Subscription<T>) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures::stream::unfold(Some(sub), |state| async move {
        let mut sub = state?;
        let frame = match sub.next().await? {
            Ok(ev) => WatchFrame::Event(ev),
            Err(e) => return Some((Ok(error_frame(&e.to_string())), None)),
        };
        match serde_json::to_vec(&frame) {
            Ok(mut line) => {
                line.push(b'\n');
                Some((Ok(Bytes::from(line)), Some(sub)))
            }
            Err(e) => {
                warn!(kind = %T::KIND, error = %e, "failed to encode watch frame");
                Some((Ok(error_frame(&format!("encoding failed: {}", e))), None))
            }
        }
    })
}

fn error_frame(message: &str) -> Bytes {
    let mut line = serde_json::json!({ "type": "error", "message": message }).to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

async fn healthz() -> &'static str { "ok\n" }

#[derive(Serialize)]
struct Readiness {
    ready: bool,
    feeds: BTreeMap<ResourceKind, FeedState>,
}

async fn readyz(State(health): State<FeedHealth>) -> Response {
    let ready = health.is_ready();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(Readiness { ready, feeds: health.snapshot() })).into_response()
}

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve `router` on `listener` until `cancel` fires, then drain open connections.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> Result<(), ServeError> {
    let addr = listener.local_addr()?;
    info!(%addr, "change service listening");
    axum::serve(listener, router).with_graceful_shutdown(async move { cancel.cancelled().await }).await?;
    info!(%addr, "change service stopped");
    Ok(())
}
