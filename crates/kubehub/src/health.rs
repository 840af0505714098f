use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::ResourceKind;
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FeedState {
    Starting,
    Live,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

/// Shared per-kind feed states backing the readiness probe.
#[derive(Debug, Clone, Default)]
pub struct FeedHealth {
    states: Arc<RwLock<BTreeMap<ResourceKind, FeedState>>>,
}

impl FeedHealth {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, kind: ResourceKind, state: FeedState) {
        let live = matches!(state, FeedState::Live);
        self.states.write().insert(kind, state);
        metrics::gauge!("feed_live", if live { 1.0 } else { 0.0 }, "kind" => kind.as_str());
    }

    pub fn get(&self, kind: ResourceKind) -> Option<FeedState> {
        self.states.read().get(&kind).cloned()
    }

    /// Ready once at least one feed is registered and every registered feed is live.
    pub fn is_ready(&self) -> bool {
        let states = self.states.read();
        !states.is_empty() && states.values().all(|s| matches!(s, FeedState::Live))
    }

    pub fn failures(&self) -> Vec<(ResourceKind, String)> {
        self.states
            .read()
            .iter()
            .filter_map(|(k, s)| match s {
                FeedState::Failed { reason } => Some((*k, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceKind, FeedState> { self.states.read().clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_every_registered_feed_live() {
        let h = FeedHealth::new();
        assert!(!h.is_ready());
        h.set(ResourceKind::Route, FeedState::Live);
        h.set(ResourceKind::Cluster, FeedState::Reconnecting { attempt: 1 });
        assert!(!h.is_ready());
        h.set(ResourceKind::Cluster, FeedState::Live);
        assert!(h.is_ready());
        h.set(ResourceKind::Certificate, FeedState::Failed { reason: "forbidden".into() });
        assert!(!h.is_ready());
        assert_eq!(h.failures(), vec![(ResourceKind::Certificate, "forbidden".to_string())]);
    }
}
