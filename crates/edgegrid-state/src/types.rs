//! Domain types for the EdgeGrid control plane.
//!
//! View models for cluster-owned objects (nodes, functions, pods), the
//! per-community desired state (`CommunitySchedule`), the partitioning
//! configuration, and the raw metric samples persisted by the sample store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use edgegrid_core::FunctionKey;
use serde::{Deserialize, Serialize};

/// Name of a node in the cluster.
pub type NodeName = String;

/// `function → node → should a replica run here`.
pub type Allocation = BTreeMap<FunctionKey, BTreeMap<NodeName, bool>>;

/// `source node → destination node → function → traffic weight`.
pub type RoutingRules = BTreeMap<NodeName, BTreeMap<NodeName, BTreeMap<FunctionKey, f64>>>;

// ── Node ──────────────────────────────────────────────────────────

/// Role of a node inside its community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "member" => Ok(Role::Member),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A cluster node as seen by the control plane.
///
/// `community`, `role`, `gpu_memory_bytes` and `master` are decoded from
/// node labels at the cluster boundary; `labels` holds every other label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub name: NodeName,
    pub address: String,
    pub capacity_memory_bytes: u64,
    pub capacity_cpu_millis: u64,
    pub gpu_memory_bytes: Option<u64>,
    pub community: Option<String>,
    pub role: Option<Role>,
    pub ready: bool,
    pub master: bool,
    pub labels: BTreeMap<String, String>,
    pub resource_version: u64,
}

impl NodeView {
    /// Ready, non-master nodes are the only ones partitioned into communities.
    pub fn is_schedulable_worker(&self) -> bool {
        self.ready && !self.master
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_memory_bytes.is_some_and(|m| m > 0)
    }
}

// ── Function ──────────────────────────────────────────────────────

/// Resource quantities for a function instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_memory_bytes: u64,
    /// Fraction of a virtual GPU (0.0 when unused).
    pub vgpu: f64,
}

/// A deployable function, read from the function registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub key: FunctionKey,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_function_port")]
    pub port: u16,
    #[serde(default)]
    pub requests: Resources,
    #[serde(default)]
    pub limits: Resources,
    /// Whether the function can run on GPU nodes.
    #[serde(default)]
    pub gpu: bool,
    /// Maximum tolerated network delay (ms) between caller and replica.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: i64,
}

fn default_function_port() -> u16 {
    8080
}

fn default_max_delay() -> i64 {
    100
}

// ── Pod ───────────────────────────────────────────────────────────

/// Lifecycle phase of a function instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Terminating,
}

/// A running (or starting) function instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodView {
    pub namespace: String,
    pub name: String,
    pub function: FunctionKey,
    pub community: String,
    /// Node the pod is bound to; `None` until bound.
    pub node: Option<NodeName>,
    pub gpu: bool,
    pub phase: PodPhase,
    pub ready: bool,
    /// Set once a delete has been requested but the pod is still draining.
    pub deletion_requested: bool,
    pub ip: Option<String>,
    pub port: u16,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub requests: Resources,
    pub limits: Resources,
    pub labels: BTreeMap<String, String>,
    pub resource_version: u64,
}

impl PodView {
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    /// Upstream URL of this instance, once it has an address.
    pub fn endpoint_url(&self) -> Option<String> {
        self.ip
            .as_ref()
            .map(|ip| format!("http://{ip}:{}", self.port))
    }
}

// ── Community ─────────────────────────────────────────────────────

/// A group of low-latency nodes with exactly one leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub namespace: String,
    pub name: String,
    pub leader: NodeName,
    /// Every node in the community, leader included.
    pub members: Vec<NodeName>,
}

/// Desired placement and routing for one community.
///
/// Created empty when the community is created and overwritten wholesale
/// by each scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunitySchedule {
    pub namespace: String,
    pub community: String,
    #[serde(default)]
    pub cpu_allocations: Allocation,
    #[serde(default)]
    pub gpu_allocations: Allocation,
    #[serde(default)]
    pub cpu_routing_rules: RoutingRules,
    #[serde(default)]
    pub gpu_routing_rules: RoutingRules,
    #[serde(default)]
    pub resource_version: u64,
}

impl CommunitySchedule {
    pub fn empty(namespace: &str, community: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            community: community.to_string(),
            ..Self::default()
        }
    }

    /// Reconciliation key, `{namespace}/{community}`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.community)
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_allocations.is_empty()
            && self.gpu_allocations.is_empty()
            && self.cpu_routing_rules.is_empty()
            && self.gpu_routing_rules.is_empty()
    }
}

// ── Community configuration ───────────────────────────────────────

/// Parameters forwarded to the community partitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityParameters {
    pub community_size: u32,
    pub maximum_delay: i64,
    pub probability_threshold: f64,
    pub iterations: u32,
}

impl Default for CommunityParameters {
    fn default() -> Self {
        Self {
            community_size: 10,
            maximum_delay: 100,
            probability_threshold: 0.2,
            iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityConfigurationStatus {
    /// Names of the communities generated by the last partition.
    #[serde(default)]
    pub communities: Vec<String>,
}

/// Cluster-wide partitioning request for one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityConfiguration {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub parameters: CommunityParameters,
    #[serde(default)]
    pub status: CommunityConfigurationStatus,
    #[serde(default)]
    pub resource_version: u64,
}

impl CommunityConfiguration {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// ── Metric samples ────────────────────────────────────────────────

/// One observed request round trip, emitted once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponseTime {
    pub timestamp_ms: u64,
    /// Node that dispatched the request.
    pub source: NodeName,
    /// Node that served it.
    pub destination: NodeName,
    pub function: String,
    pub namespace: String,
    pub community: String,
    pub gpu: bool,
    pub latency_ms: f64,
    pub status: u16,
    pub description: String,
}

/// One CPU usage observation for a function on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResourceData {
    pub timestamp_ms: u64,
    pub node: NodeName,
    pub function: String,
    pub namespace: String,
    pub community: String,
    pub cores: f64,
}
