//! Gantry core types: resource kinds, identifiers and change events.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod resources;

pub use resources::{
    AuthenticationPolicy, Certificate, Cluster, Destination, HeaderMatch, Middleware, Route,
    RouteMatch, ServiceDiscovery,
};

pub mod prelude {
    pub use super::{ChangeEvent, ChangeKind, Resource, ResourceId, ResourceKind};
    pub use super::resources::*;
}

/// Stable identifier of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self { Self(s) }
}

impl std::borrow::Borrow<str> for ResourceId {
    fn borrow(&self) -> &str { &self.0 }
}

/// The configuration resource types distributed to the data plane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Route,
    Cluster,
    Middleware,
    Certificate,
    AuthenticationPolicy,
    ServiceDiscovery,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Route,
        ResourceKind::Cluster,
        ResourceKind::Middleware,
        ResourceKind::Certificate,
        ResourceKind::AuthenticationPolicy,
        ResourceKind::ServiceDiscovery,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Route => "route",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Middleware => "middleware",
            ResourceKind::Certificate => "certificate",
            ResourceKind::AuthenticationPolicy => "authentication-policy",
            ResourceKind::ServiceDiscovery => "service-discovery",
        }
    }

    /// Collection name in the document store; also the URL segment of the change service.
    pub const fn collection(&self) -> &'static str {
        match self {
            ResourceKind::Route => "routes",
            ResourceKind::Cluster => "clusters",
            ResourceKind::Middleware => "middlewares",
            ResourceKind::Certificate => "certificates",
            ResourceKind::AuthenticationPolicy => "authentication-policies",
            ResourceKind::ServiceDiscovery => "service-discoveries",
        }
    }

    /// Kubernetes custom resource kind used by the kube-backed store.
    pub const fn kube_kind(&self) -> &'static str {
        match self {
            ResourceKind::Route => "Route",
            ResourceKind::Cluster => "Cluster",
            ResourceKind::Middleware => "Middleware",
            ResourceKind::Certificate => "Certificate",
            ResourceKind::AuthenticationPolicy => "AuthenticationPolicy",
            ResourceKind::ServiceDiscovery => "ServiceDiscovery",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    /// Accepts the singular name, the collection name or the kube kind, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|k| {
                k.as_str() == needle
                    || k.collection() == needle
                    || k.kube_kind().to_ascii_lowercase() == needle
            })
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A typed configuration document.
pub trait Resource:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;

    fn id(&self) -> &ResourceId;
}

/// Discriminant of a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Listed,
    Created,
    Updated,
    Deleted,
    Synced,
    Interrupted,
}

/// One ordered event of a resource type's change feed.
///
/// `Listed` events replay the full collection after every (re)subscription and are
/// authoritative: the burst is closed by `Synced`, after which live deltas follow.
/// `Interrupted` is emitted when the underlying feed terminates; a new `Listed`
/// burst follows once the feed is reopened.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Listed(T),
    Created(T),
    Updated(T),
    Deleted { id: ResourceId, previous: Option<T> },
    Synced,
    Interrupted,
}

impl<T: Resource> ChangeEvent<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Listed(_) => ChangeKind::Listed,
            ChangeEvent::Created(_) => ChangeKind::Created,
            ChangeEvent::Updated(_) => ChangeKind::Updated,
            ChangeEvent::Deleted { .. } => ChangeKind::Deleted,
            ChangeEvent::Synced => ChangeKind::Synced,
            ChangeEvent::Interrupted => ChangeKind::Interrupted,
        }
    }

    /// Identity of the affected resource; `None` for control markers.
    pub fn id(&self) -> Option<&ResourceId> {
        match self {
            ChangeEvent::Listed(r) | ChangeEvent::Created(r) | ChangeEvent::Updated(r) => Some(r.id()),
            ChangeEvent::Deleted { id, .. } => Some(id),
            ChangeEvent::Synced | ChangeEvent::Interrupted => None,
        }
    }

    /// Post-image for upserts, pre-image (if known) for deletes.
    pub fn resource(&self) -> Option<&T> {
        match self {
            ChangeEvent::Listed(r) | ChangeEvent::Created(r) | ChangeEvent::Updated(r) => Some(r),
            ChangeEvent::Deleted { previous, .. } => previous.as_ref(),
            ChangeEvent::Synced | ChangeEvent::Interrupted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_all_spellings() {
        assert_eq!("route".parse::<ResourceKind>(), Ok(ResourceKind::Route));
        assert_eq!("Routes".parse::<ResourceKind>(), Ok(ResourceKind::Route));
        assert_eq!("AuthenticationPolicy".parse::<ResourceKind>(), Ok(ResourceKind::AuthenticationPolicy));
        assert_eq!("authentication-policies".parse::<ResourceKind>(), Ok(ResourceKind::AuthenticationPolicy));
        assert_eq!("service-discovery".parse::<ResourceKind>(), Ok(ResourceKind::ServiceDiscovery));
        assert!("listener".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn collections_are_unique() {
        let mut names: Vec<_> = ResourceKind::ALL.iter().map(|k| k.collection()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ResourceKind::ALL.len());
    }

    #[test]
    fn delete_event_exposes_identity_without_pre_image() {
        let ev: ChangeEvent<Route> = ChangeEvent::Deleted { id: "r1".into(), previous: None };
        assert_eq!(ev.kind(), ChangeKind::Deleted);
        assert_eq!(ev.id().map(|i| i.as_str()), Some("r1"));
        assert!(ev.resource().is_none());
        assert!(ChangeEvent::<Route>::Synced.id().is_none());
    }
}
