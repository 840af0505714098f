//! Configuration snapshot: the data-plane shape built from the merged views.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::{
    AuthenticationPolicy, Cluster, HeaderMatch, Middleware, Resource, ResourceId, Route, ServiceDiscovery,
};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::merge::ResourceViews;
use crate::publish::InvalidationSignal;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("route {route}: invalid path template {template:?}: {reason}")]
    InvalidPath { route: ResourceId, template: String, reason: String },
}

/// Cross-reference from one resource to another. Unresolved targets are kept as-is.
#[derive(Debug, Clone)]
pub enum Reference<T> {
    Resolved { id: ResourceId, target: Arc<T> },
    Dangling { id: ResourceId },
}

impl<T> Reference<T> {
    fn lookup(id: &ResourceId, table: &BTreeMap<ResourceId, Arc<T>>) -> Self {
        match table.get(id) {
            Some(target) => Reference::Resolved { id: id.clone(), target: Arc::clone(target) },
            None => Reference::Dangling { id: id.clone() },
        }
    }

    pub fn id(&self) -> &ResourceId {
        match self {
            Reference::Resolved { id, .. } | Reference::Dangling { id } => id,
        }
    }

    pub fn target(&self) -> Option<&T> {
        match self {
            Reference::Resolved { target, .. } => Some(target),
            Reference::Dangling { .. } => None,
        }
    }

    pub fn is_dangling(&self) -> bool { matches!(self, Reference::Dangling { .. }) }
}

/// Compiled route path template.
///
/// `{name}` matches one segment, `{*name}` and `{**name}` match the remainder of the
/// path and must close the template. Literal text matches exactly.
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    params: Vec<String>,
}

impl PathPattern {
    pub fn compile(template: &str) -> Result<Self, String> {
        if !template.starts_with('/') {
            return Err("must start with '/'".into());
        }
        let mut pattern = String::from("^");
        let mut params: Vec<String> = Vec::new();
        let mut rest = template;
        let mut catch_all = false;
        while !rest.is_empty() {
            if catch_all {
                return Err("catch-all parameter must be last".into());
            }
            match rest.find(['{', '}']) {
                None => {
                    pattern.push_str(&regex::escape(rest));
                    rest = "";
                }
                Some(i) if rest.as_bytes()[i] == b'}' => return Err("unbalanced '}'".into()),
                Some(i) => {
                    let literal = &rest[..i];
                    let Some(end) = rest[i..].find('}') else {
                        return Err("unterminated '{'".into());
                    };
                    let raw = &rest[i + 1..i + end];
                    let (name, greedy) = match raw.strip_prefix("**").or_else(|| raw.strip_prefix('*')) {
                        Some(n) => (n, true),
                        None => (raw, false),
                    };
                    if !valid_param(name) {
                        return Err(format!("invalid parameter name {:?}", raw));
                    }
                    if params.iter().any(|p| p == name) {
                        return Err(format!("duplicate parameter {:?}", name));
                    }
                    // `/static/{**rest}` also matches the bare `/static`; the root slash stays required.
                    let bare_prefix = greedy && literal.ends_with('/') && (pattern.len() > 1 || literal.len() > 1);
                    if bare_prefix {
                        pattern.push_str(&regex::escape(&literal[..literal.len() - 1]));
                        pattern.push_str(&format!("(?:/(?P<{}>.*))?", name));
                    } else {
                        pattern.push_str(&regex::escape(literal));
                        if greedy {
                            pattern.push_str(&format!("(?P<{}>.*)", name));
                        } else {
                            pattern.push_str(&format!("(?P<{}>[^/]+)", name));
                        }
                    }
                    catch_all = greedy;
                    params.push(name.to_string());
                    rest = &rest[i + end + 1..];
                }
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern).map_err(|e| e.to_string())?;
        Ok(Self { template: template.to_string(), regex, params })
    }

    pub fn template(&self) -> &str { &self.template }
    pub fn params(&self) -> &[String] { &self.params }

    /// Captured parameters if `path` matches. A catch-all that matched nothing is empty.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .map(|p| (p.clone(), caps.name(p).map_or_else(String::new, |m| m.as_str().to_string())))
                .collect(),
        )
    }
}

fn valid_param(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A cluster joined with the service-discovery sources that feed it.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster: Cluster,
    pub discovery: Vec<Arc<ServiceDiscovery>>,
}

impl ClusterConfig {
    pub fn id(&self) -> &ResourceId { &self.cluster.id }
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub id: ResourceId,
    pub order: i32,
    pub path: Option<PathPattern>,
    /// Lowercased.
    pub hosts: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<HeaderMatch>,
    pub cluster: Option<Reference<ClusterConfig>>,
    pub middlewares: Vec<Reference<Middleware>>,
    pub authentication_policy: Option<Reference<AuthenticationPolicy>>,
    pub metadata: BTreeMap<String, String>,
}

impl RouteConfig {
    fn dangling(&self) -> usize {
        self.cluster.iter().filter(|r| r.is_dangling()).count()
            + self.middlewares.iter().filter(|r| r.is_dangling()).count()
            + self.authentication_policy.iter().filter(|r| r.is_dangling()).count()
    }
}

/// Immutable, versioned configuration consumed by the data plane.
#[derive(Debug, Clone)]
pub struct ConfigurationSnapshot {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Ordered by `(order, id)`.
    pub routes: Vec<RouteConfig>,
    pub clusters: BTreeMap<ResourceId, Arc<ClusterConfig>>,
    pub middlewares: BTreeMap<ResourceId, Arc<Middleware>>,
    pub authentication_policies: BTreeMap<ResourceId, Arc<AuthenticationPolicy>>,
    /// SNI host (lowercased) to certificate id.
    pub certificates: BTreeMap<String, ResourceId>,
    /// Discovery sources whose cluster does not exist.
    pub orphan_discovery: Vec<Arc<ServiceDiscovery>>,
    invalidation: InvalidationSignal,
}

impl ConfigurationSnapshot {
    pub fn empty(version: u64) -> Self {
        Self {
            version,
            created_at: Utc::now(),
            routes: Vec::new(),
            clusters: BTreeMap::new(),
            middlewares: BTreeMap::new(),
            authentication_policies: BTreeMap::new(),
            certificates: BTreeMap::new(),
            orphan_discovery: Vec::new(),
            invalidation: InvalidationSignal::detached(),
        }
    }

    /// Fires once this snapshot has been superseded.
    pub fn invalidation(&self) -> InvalidationSignal { self.invalidation.clone() }

    pub(crate) fn with_invalidation(mut self, signal: InvalidationSignal) -> Self {
        self.invalidation = signal;
        self
    }

    pub fn route(&self, id: &str) -> Option<&RouteConfig> { self.routes.iter().find(|r| r.id.as_str() == id) }

    pub fn certificate_for(&self, host: &str) -> Option<&ResourceId> {
        self.certificates.get(&host.to_ascii_lowercase())
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            version: self.version,
            created_at: self.created_at,
            routes: self.routes.len(),
            clusters: self.clusters.len(),
            middlewares: self.middlewares.len(),
            authentication_policies: self.authentication_policies.len(),
            certificate_hosts: self.certificates.len(),
            dangling_references: self.routes.iter().map(RouteConfig::dangling).sum(),
            orphan_discovery: self.orphan_discovery.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub routes: usize,
    pub clusters: usize,
    pub middlewares: usize,
    pub authentication_policies: usize,
    pub certificate_hosts: usize,
    pub dangling_references: usize,
    pub orphan_discovery: usize,
}

impl fmt::Display for SnapshotSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} routes={} clusters={} middlewares={} auth={} cert_hosts={} dangling={} orphan_discovery={}",
            self.version,
            self.routes,
            self.clusters,
            self.middlewares,
            self.authentication_policies,
            self.certificate_hosts,
            self.dangling_references,
            self.orphan_discovery
        )
    }
}

/// Builds snapshots from merged views; keeps compiled path templates between builds.
#[derive(Default)]
pub struct SnapshotBuilder {
    patterns: FxHashMap<String, PathPattern>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn build(&mut self, views: &ResourceViews, version: u64) -> Result<ConfigurationSnapshot, BuildError> {
        let middlewares = arc_table(views.middlewares.iter());
        let authentication_policies = arc_table(views.authentication_policies.iter());

        let mut discovery: BTreeMap<ResourceId, Vec<Arc<ServiceDiscovery>>> = BTreeMap::new();
        for sd in views.service_discoveries.sorted() {
            discovery.entry(sd.cluster_id.clone()).or_default().push(Arc::new(sd.clone()));
        }
        let mut clusters: BTreeMap<ResourceId, Arc<ClusterConfig>> = BTreeMap::new();
        for c in views.clusters.iter() {
            let sources = discovery.remove(&c.id).unwrap_or_default();
            clusters.insert(c.id.clone(), Arc::new(ClusterConfig { cluster: c.clone(), discovery: sources }));
        }
        let orphan_discovery: Vec<_> = discovery.into_values().flatten().collect();
        if !orphan_discovery.is_empty() {
            debug!(count = orphan_discovery.len(), "service discovery sources reference unknown clusters");
        }

        let mut certificates: BTreeMap<String, ResourceId> = BTreeMap::new();
        for cert in views.certificates.sorted() {
            for host in &cert.hosts {
                let host = host.to_ascii_lowercase();
                match certificates.get(&host) {
                    Some(existing) if existing != cert.id() => {
                        warn!(host = %host, kept = %existing, ignored = %cert.id, "conflicting certificate host");
                    }
                    Some(_) => {}
                    None => {
                        certificates.insert(host, cert.id.clone());
                    }
                }
            }
        }

        let mut ordered: Vec<&Route> = views.routes.iter().collect();
        ordered.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        let mut used_templates: Vec<&str> = Vec::new();
        let mut routes = Vec::with_capacity(ordered.len());
        for r in ordered {
            let path = match r.route_match.path.as_deref() {
                Some(template) => {
                    used_templates.push(template);
                    Some(self.pattern(&r.id, template)?)
                }
                None => None,
            };
            routes.push(RouteConfig {
                id: r.id.clone(),
                order: r.order,
                path,
                hosts: r.route_match.hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
                methods: r.route_match.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                headers: r.route_match.headers.clone(),
                cluster: r.cluster_id.as_ref().map(|id| Reference::lookup(id, &clusters)),
                middlewares: r.middlewares.iter().map(|id| Reference::lookup(id, &middlewares)).collect(),
                authentication_policy: r
                    .authentication_policy
                    .as_ref()
                    .map(|id| Reference::lookup(id, &authentication_policies)),
                metadata: r.metadata.clone(),
            });
        }
        self.patterns.retain(|t, _| used_templates.contains(&t.as_str()));

        Ok(ConfigurationSnapshot {
            version,
            created_at: Utc::now(),
            routes,
            clusters,
            middlewares,
            authentication_policies,
            certificates,
            orphan_discovery,
            invalidation: InvalidationSignal::detached(),
        })
    }

    fn pattern(&mut self, route: &ResourceId, template: &str) -> Result<PathPattern, BuildError> {
        if let Some(p) = self.patterns.get(template) {
            return Ok(p.clone());
        }
        let compiled = PathPattern::compile(template).map_err(|reason| BuildError::InvalidPath {
            route: route.clone(),
            template: template.to_string(),
            reason,
        })?;
        self.patterns.insert(template.to_string(), compiled.clone());
        Ok(compiled)
    }
}

fn arc_table<'a, T: Resource>(items: impl Iterator<Item = &'a T>) -> BTreeMap<ResourceId, Arc<T>> {
    items.map(|r| (r.id().clone(), Arc::new(r.clone()))).collect()
}
