//! Document shapes of the six configuration resource types.
//!
//! All documents use camelCase JSON, ignore unknown fields and default every
//! optional section, so partial documents written by administrative tooling parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Resource, ResourceId, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Route {
    pub id: ResourceId,
    pub cluster_id: Option<ResourceId>,
    /// Lower values are matched first.
    pub order: i32,
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    pub middlewares: Vec<ResourceId>,
    pub authentication_policy: Option<ResourceId>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteMatch {
    /// Path template, e.g. `/api/{version}/{**rest}`.
    pub path: Option<String>,
    pub hosts: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<HeaderMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderMatch {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cluster {
    pub id: ResourceId,
    pub destinations: BTreeMap<String, Destination>,
    pub load_balancing_policy: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Destination {
    pub address: String,
    pub health: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Middleware {
    pub id: ResourceId,
    /// Middleware implementation name, e.g. `httpsRedirect` or `rateLimit`.
    pub kind: String,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Certificate {
    pub id: ResourceId,
    pub hosts: Vec<String>,
    /// Reference into the certificate storage; the material itself never travels here.
    pub secret_ref: String,
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationPolicy {
    pub id: ResourceId,
    pub scheme: String,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDiscovery {
    pub id: ResourceId,
    pub cluster_id: ResourceId,
    pub provider: String,
    pub settings: serde_json::Value,
}

macro_rules! impl_resource {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl Resource for $ty {
                const KIND: ResourceKind = $kind;
                fn id(&self) -> &ResourceId { &self.id }
            }
        )*
    };
}

impl_resource! {
    Route => ResourceKind::Route,
    Cluster => ResourceKind::Cluster,
    Middleware => ResourceKind::Middleware,
    Certificate => ResourceKind::Certificate,
    AuthenticationPolicy => ResourceKind::AuthenticationPolicy,
    ServiceDiscovery => ResourceKind::ServiceDiscovery,
}

impl Route {
    pub fn new(id: impl Into<ResourceId>, cluster_id: Option<&str>) -> Self {
        Self { id: id.into(), cluster_id: cluster_id.map(ResourceId::from), ..Default::default() }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.route_match.path = Some(path.to_string());
        self
    }
}

impl Cluster {
    pub fn new(id: impl Into<ResourceId>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_destination(mut self, name: &str, address: &str) -> Self {
        self.destinations.insert(name.to_string(), Destination { address: address.to_string(), health: None });
        self
    }
}
