//! Gantry streaming change service.
//!
//! Re-exposes each kind's adapter + accumulator pair over HTTP so remote data-plane
//! processes can `List` the current resources and then `Watch` the ordered deltas
//! that follow. [`RemoteStore`] turns a remote service back into a
//! [`gantry_kubehub::DocumentStore`], so a remote process runs the same pipeline;
//! [`LocalStore`] does the same for the process hosting the service.

#![forbid(unsafe_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

mod client;
mod hub;
mod local;
mod server;

pub use client::{ChangeServiceClient, ClientError, RemoteStore};
pub use hub::{ChangeHub, Subscription};
pub use local::LocalStore;
pub use server::{serve, ChangeService, ServeError, ServiceConfig};

/// Wire name of a delta in a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One delta of a watch stream. `resource` is the post-image, or the removed value for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse<T> {
    pub resource: T,
    pub event_type: EventType,
}

/// Newline-delimited frame of `GET /v1/{collection}/watch`. An `error` frame is
/// always the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WatchFrame<T> {
    Event(WatchResponse<T>),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

/// Errors surfaced to change-service callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    /// The upstream change feed is not live; callers retry and re-list.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The watch ended; the subscriber must re-list before watching again.
    #[error("terminated: {0}")]
    Terminated(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Terminated(_) => StatusCode::GONE,
        };
        (status, Json(ApiErrorResponse { error_message: self.to_string() })).into_response()
    }
}
