//! The cluster API boundary.
//!
//! Controllers never touch a watch/cache mechanism directly. They read
//! typed views synchronously through [`ClusterApi`], write through
//! compare-and-update calls, and learn about changes from the
//! [`ClusterEvent`] broadcast returned by [`ClusterApi::subscribe`].

use async_trait::async_trait;
use edgegrid_core::FunctionKey;
use tokio::sync::broadcast;

use crate::error::StateResult;
use crate::types::*;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Upserted,
    Deleted,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Node {
        kind: EventKind,
        name: String,
    },
    Function {
        kind: EventKind,
        key: FunctionKey,
    },
    Pod {
        kind: EventKind,
        namespace: String,
        name: String,
        community: String,
    },
    Schedule {
        kind: EventKind,
        namespace: String,
        community: String,
    },
    Configuration {
        kind: EventKind,
        namespace: String,
        name: String,
    },
}

/// Filter for [`ClusterApi::list_nodes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSelector {
    pub community: Option<String>,
    /// Only ready, non-master nodes.
    pub workers_only: bool,
}

impl NodeSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn workers() -> Self {
        Self {
            community: None,
            workers_only: true,
        }
    }

    pub fn in_community(community: &str) -> Self {
        Self {
            community: Some(community.to_string()),
            workers_only: true,
        }
    }

    pub fn matches(&self, node: &NodeView) -> bool {
        if self.workers_only && !node.is_schedulable_worker() {
            return false;
        }
        match &self.community {
            Some(c) => node.community.as_deref() == Some(c.as_str()),
            None => true,
        }
    }
}

/// Filter for [`ClusterApi::list_pods`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSelector {
    pub namespace: String,
    pub community: Option<String>,
    pub function: Option<FunctionKey>,
}

impl PodSelector {
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    pub fn community(namespace: &str, community: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            community: Some(community.to_string()),
            function: None,
        }
    }

    pub fn matches(&self, pod: &PodView) -> bool {
        pod.namespace == self.namespace
            && self
                .community
                .as_ref()
                .is_none_or(|c| &pod.community == c)
            && self.function.as_ref().is_none_or(|f| &pod.function == f)
    }
}

/// Typed access to cluster-owned state.
///
/// Writes that carry a `resource_version` are compare-and-update: a stale
/// version fails with `StateError::Conflict`, which callers treat as
/// retryable.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    // ── Nodes ──────────────────────────────────────────────────────

    async fn get_node(&self, name: &str) -> StateResult<NodeView>;

    async fn list_nodes(&self, selector: &NodeSelector) -> StateResult<Vec<NodeView>>;

    /// Persist `community`/`role` (and raw labels) of a node.
    async fn update_node(&self, node: &NodeView) -> StateResult<NodeView>;

    // ── Functions ──────────────────────────────────────────────────

    async fn get_function(&self, key: &FunctionKey) -> StateResult<FunctionSpec>;

    async fn list_functions(&self, namespace: &str) -> StateResult<Vec<FunctionSpec>>;

    // ── Pods ───────────────────────────────────────────────────────

    async fn get_pod(&self, namespace: &str, name: &str) -> StateResult<PodView>;

    async fn list_pods(&self, selector: &PodSelector) -> StateResult<Vec<PodView>>;

    async fn create_pod(&self, pod: &PodView) -> StateResult<PodView>;

    /// Assign a created pod to a node (scheduler-less placement).
    async fn bind_pod(&self, namespace: &str, name: &str, node: &str) -> StateResult<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> StateResult<()>;

    // ── Community schedules ────────────────────────────────────────

    async fn get_schedule(&self, namespace: &str, community: &str)
    -> StateResult<CommunitySchedule>;

    async fn list_schedules(&self, namespace: &str) -> StateResult<Vec<CommunitySchedule>>;

    async fn create_schedule(&self, schedule: &CommunitySchedule)
    -> StateResult<CommunitySchedule>;

    async fn update_schedule(&self, schedule: &CommunitySchedule)
    -> StateResult<CommunitySchedule>;

    async fn delete_schedule(&self, namespace: &str, community: &str) -> StateResult<()>;

    // ── Community configurations ───────────────────────────────────

    async fn get_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> StateResult<CommunityConfiguration>;

    async fn list_configurations(&self) -> StateResult<Vec<CommunityConfiguration>>;

    async fn update_configuration_status(
        &self,
        configuration: &CommunityConfiguration,
    ) -> StateResult<CommunityConfiguration>;

    // ── Events ─────────────────────────────────────────────────────

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}
