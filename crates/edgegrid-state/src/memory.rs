//! In-process [`ClusterApi`] implementation.
//!
//! Backs standalone mode and every controller test. Nodes are kept with
//! their raw label sets and decoded through [`crate::labels`] on read, the
//! same way an external cluster would be adapted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use edgegrid_core::FunctionKey;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cluster::{ClusterApi, ClusterEvent, EventKind, NodeSelector, PodSelector};
use crate::error::{StateError, StateResult};
use crate::labels;
use crate::types::*;

const EVENT_BUFFER: usize = 1024;

// ── Manifest ──────────────────────────────────────────────────────

/// Node entry of a cluster manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestNode {
    pub name: String,
    pub address: String,
    #[serde(default = "default_cpu")]
    pub cpu_millis: u64,
    #[serde(default = "default_memory")]
    pub memory_bytes: u64,
    #[serde(default = "default_ready")]
    pub ready: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_cpu() -> u64 {
    4000
}

fn default_memory() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_ready() -> bool {
    true
}

/// Static description of a cluster, loaded from TOML in standalone mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterManifest {
    pub nodes: Vec<ManifestNode>,
    pub functions: Vec<FunctionSpec>,
    pub configurations: Vec<CommunityConfiguration>,
}

impl ClusterManifest {
    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StateError::Read(format!("{path:?}: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> StateResult<Self> {
        toml::from_str(content).map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

// ── Storage ───────────────────────────────────────────────────────

/// A node as the cluster stores it: labels are the source of truth.
#[derive(Debug, Clone)]
struct RawNode {
    name: String,
    address: String,
    capacity_memory_bytes: u64,
    capacity_cpu_millis: u64,
    ready: bool,
    labels: BTreeMap<String, String>,
    resource_version: u64,
}

impl RawNode {
    fn view(&self) -> NodeView {
        let (rel, rest) = labels::decode_node(&self.labels);
        NodeView {
            name: self.name.clone(),
            address: self.address.clone(),
            capacity_memory_bytes: self.capacity_memory_bytes,
            capacity_cpu_millis: self.capacity_cpu_millis,
            gpu_memory_bytes: rel.gpu_memory_bytes,
            community: rel.community,
            role: rel.role,
            ready: self.ready,
            master: rel.master,
            labels: rest,
            resource_version: self.resource_version,
        }
    }
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, RawNode>,
    functions: BTreeMap<FunctionKey, FunctionSpec>,
    pods: BTreeMap<(String, String), PodView>,
    schedules: BTreeMap<(String, String), CommunitySchedule>,
    configurations: BTreeMap<(String, String), CommunityConfiguration>,
    version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Cluster state held in memory.
pub struct MemoryCluster {
    inner: RwLock<Inner>,
    events: broadcast::Sender<ClusterEvent>,
    /// When set, bound pods become running and ready immediately.
    auto_ready: bool,
    node_writes: AtomicU64,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MemoryCluster {
    pub fn new(auto_ready: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            auto_ready,
            node_writes: AtomicU64::new(0),
        }
    }

    pub fn from_manifest(manifest: ClusterManifest, auto_ready: bool) -> Self {
        let cluster = Self::new(auto_ready);
        {
            let mut inner = cluster.inner.write().expect("cluster lock");
            for node in manifest.nodes {
                let version = inner.next_version();
                inner.nodes.insert(
                    node.name.clone(),
                    RawNode {
                        name: node.name,
                        address: node.address,
                        capacity_memory_bytes: node.memory_bytes,
                        capacity_cpu_millis: node.cpu_millis,
                        ready: node.ready,
                        labels: node.labels,
                        resource_version: version,
                    },
                );
            }
            for function in manifest.functions {
                inner.functions.insert(function.key.clone(), function);
            }
            for mut config in manifest.configurations {
                config.resource_version = inner.next_version();
                inner
                    .configurations
                    .insert((config.namespace.clone(), config.name.clone()), config);
            }
            debug!(
                nodes = inner.nodes.len(),
                functions = inner.functions.len(),
                configurations = inner.configurations.len(),
                "cluster manifest loaded"
            );
        }
        cluster
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Number of successful node writes since creation.
    pub fn node_writes(&self) -> u64 {
        self.node_writes.load(Ordering::Relaxed)
    }

    // ── Direct mutation (cluster-owned changes) ────────────────────

    /// Insert or replace a node, encoding its typed relations as labels.
    pub fn insert_node(&self, node: NodeView) {
        let mut raw_labels =
            labels::encode_node(&node.labels, node.community.as_deref(), node.role);
        if let Some(gpu) = node.gpu_memory_bytes {
            raw_labels.insert(labels::GPU_MEMORY.to_string(), gpu.to_string());
        }
        if node.master {
            raw_labels.insert(labels::MASTER.to_string(), String::new());
        }
        let name = node.name.clone();
        {
            let mut inner = self.inner.write().expect("cluster lock");
            let version = inner.next_version();
            inner.nodes.insert(
                node.name.clone(),
                RawNode {
                    name: node.name,
                    address: node.address,
                    capacity_memory_bytes: node.capacity_memory_bytes,
                    capacity_cpu_millis: node.capacity_cpu_millis,
                    ready: node.ready,
                    labels: raw_labels,
                    resource_version: version,
                },
            );
        }
        self.emit(ClusterEvent::Node {
            kind: EventKind::Upserted,
            name,
        });
    }

    pub fn remove_node(&self, name: &str) {
        let removed = self
            .inner
            .write()
            .expect("cluster lock")
            .nodes
            .remove(name)
            .is_some();
        if removed {
            self.emit(ClusterEvent::Node {
                kind: EventKind::Deleted,
                name: name.to_string(),
            });
        }
    }

    pub fn insert_function(&self, function: FunctionSpec) {
        let key = function.key.clone();
        self.inner
            .write()
            .expect("cluster lock")
            .functions
            .insert(key.clone(), function);
        self.emit(ClusterEvent::Function {
            kind: EventKind::Upserted,
            key,
        });
    }

    pub fn insert_configuration(&self, mut configuration: CommunityConfiguration) {
        let (namespace, name) = (configuration.namespace.clone(), configuration.name.clone());
        {
            let mut inner = self.inner.write().expect("cluster lock");
            configuration.resource_version = inner.next_version();
            inner
                .configurations
                .insert((namespace.clone(), name.clone()), configuration);
        }
        self.emit(ClusterEvent::Configuration {
            kind: EventKind::Upserted,
            namespace,
            name,
        });
    }

    pub fn delete_configuration(&self, namespace: &str, name: &str) {
        let removed = self
            .inner
            .write()
            .expect("cluster lock")
            .configurations
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            self.emit(ClusterEvent::Configuration {
                kind: EventKind::Deleted,
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
    }

    /// Mark a bound pod running and ready, as a kubelet would.
    pub fn set_pod_ready(&self, namespace: &str, name: &str) -> StateResult<()> {
        let community = {
            let mut inner = self.inner.write().expect("cluster lock");
            let address = {
                let pod = inner
                    .pods
                    .get(&(namespace.to_string(), name.to_string()))
                    .ok_or_else(|| StateError::NotFound(format!("pod {namespace}/{name}")))?;
                pod.node
                    .as_ref()
                    .and_then(|n| inner.nodes.get(n))
                    .map(|n| n.address.clone())
            };
            let version = inner.next_version();
            let pod = inner
                .pods
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| StateError::NotFound(format!("pod {namespace}/{name}")))?;
            pod.phase = PodPhase::Running;
            pod.ready = true;
            pod.ip = address;
            pod.resource_version = version;
            pod.community.clone()
        };
        self.emit(ClusterEvent::Pod {
            kind: EventKind::Upserted,
            namespace: namespace.to_string(),
            name: name.to_string(),
            community,
        });
        Ok(())
    }
}

fn not_found(kind: &str, key: impl std::fmt::Display) -> StateError {
    StateError::NotFound(format!("{kind} {key}"))
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_node(&self, name: &str) -> StateResult<NodeView> {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .nodes
            .get(name)
            .map(RawNode::view)
            .ok_or_else(|| not_found("node", name))
    }

    async fn list_nodes(&self, selector: &NodeSelector) -> StateResult<Vec<NodeView>> {
        let inner = self.inner.read().expect("cluster lock");
        Ok(inner
            .nodes
            .values()
            .map(RawNode::view)
            .filter(|n| selector.matches(n))
            .collect())
    }

    async fn update_node(&self, node: &NodeView) -> StateResult<NodeView> {
        let view = {
            let mut inner = self.inner.write().expect("cluster lock");
            let version = inner.next_version();
            let stored = inner
                .nodes
                .get_mut(&node.name)
                .ok_or_else(|| not_found("node", &node.name))?;
            if stored.resource_version != node.resource_version {
                return Err(StateError::Conflict(format!(
                    "node {} at version {}, update based on {}",
                    node.name, stored.resource_version, node.resource_version
                )));
            }
            let (_, stored_rest) = labels::decode_node(&stored.labels);
            let mut rest = stored_rest;
            rest.extend(node.labels.clone());
            stored.labels = labels::encode_node(&rest, node.community.as_deref(), node.role);
            stored.resource_version = version;
            stored.view()
        };
        self.node_writes.fetch_add(1, Ordering::Relaxed);
        self.emit(ClusterEvent::Node {
            kind: EventKind::Upserted,
            name: node.name.clone(),
        });
        Ok(view)
    }

    async fn get_function(&self, key: &FunctionKey) -> StateResult<FunctionSpec> {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .functions
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("function", key))
    }

    async fn list_functions(&self, namespace: &str) -> StateResult<Vec<FunctionSpec>> {
        let inner = self.inner.read().expect("cluster lock");
        Ok(inner
            .functions
            .values()
            .filter(|f| f.key.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StateResult<PodView> {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("pod", format!("{namespace}/{name}")))
    }

    async fn list_pods(&self, selector: &PodSelector) -> StateResult<Vec<PodView>> {
        let inner = self.inner.read().expect("cluster lock");
        Ok(inner
            .pods
            .values()
            .filter(|p| selector.matches(p))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, pod: &PodView) -> StateResult<PodView> {
        let stored = {
            let mut inner = self.inner.write().expect("cluster lock");
            let key = (pod.namespace.clone(), pod.name.clone());
            if inner.pods.contains_key(&key) {
                return Err(StateError::AlreadyExists(format!(
                    "pod {}/{}",
                    pod.namespace, pod.name
                )));
            }
            let mut stored = pod.clone();
            stored.labels = labels::pod_labels(pod);
            stored.phase = PodPhase::Pending;
            stored.ready = false;
            stored.deletion_requested = false;
            stored.resource_version = inner.next_version();
            inner.pods.insert(key, stored.clone());
            stored
        };
        debug!(namespace = %stored.namespace, name = %stored.name, "pod created");
        self.emit(ClusterEvent::Pod {
            kind: EventKind::Upserted,
            namespace: stored.namespace.clone(),
            name: stored.name.clone(),
            community: stored.community.clone(),
        });
        Ok(stored)
    }

    async fn bind_pod(&self, namespace: &str, name: &str, node: &str) -> StateResult<()> {
        let community = {
            let mut inner = self.inner.write().expect("cluster lock");
            let address = inner
                .nodes
                .get(node)
                .map(|n| n.address.clone())
                .ok_or_else(|| not_found("node", node))?;
            let version = inner.next_version();
            let pod = inner
                .pods
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| not_found("pod", format!("{namespace}/{name}")))?;
            if let Some(bound) = &pod.node {
                if bound != node {
                    return Err(StateError::Conflict(format!(
                        "pod {namespace}/{name} already bound to {bound}"
                    )));
                }
            }
            pod.node = Some(node.to_string());
            pod.labels
                .insert(labels::NODE.to_string(), node.to_string());
            if self.auto_ready {
                pod.phase = PodPhase::Running;
                pod.ready = true;
                pod.ip = Some(address);
            }
            pod.resource_version = version;
            pod.community.clone()
        };
        debug!(%namespace, %name, %node, "pod bound");
        self.emit(ClusterEvent::Pod {
            kind: EventKind::Upserted,
            namespace: namespace.to_string(),
            name: name.to_string(),
            community,
        });
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> StateResult<()> {
        let removed = self
            .inner
            .write()
            .expect("cluster lock")
            .pods
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found("pod", format!("{namespace}/{name}")))?;
        debug!(%namespace, %name, "pod deleted");
        self.emit(ClusterEvent::Pod {
            kind: EventKind::Deleted,
            namespace: namespace.to_string(),
            name: name.to_string(),
            community: removed.community,
        });
        Ok(())
    }

    async fn get_schedule(
        &self,
        namespace: &str,
        community: &str,
    ) -> StateResult<CommunitySchedule> {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .schedules
            .get(&(namespace.to_string(), community.to_string()))
            .cloned()
            .ok_or_else(|| not_found("schedule", format!("{namespace}/{community}")))
    }

    async fn list_schedules(&self, namespace: &str) -> StateResult<Vec<CommunitySchedule>> {
        let inner = self.inner.read().expect("cluster lock");
        Ok(inner
            .schedules
            .values()
            .filter(|s| s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create_schedule(
        &self,
        schedule: &CommunitySchedule,
    ) -> StateResult<CommunitySchedule> {
        let stored = {
            let mut inner = self.inner.write().expect("cluster lock");
            let key = (schedule.namespace.clone(), schedule.community.clone());
            if inner.schedules.contains_key(&key) {
                return Err(StateError::AlreadyExists(format!("schedule {}", schedule.key())));
            }
            let mut stored = schedule.clone();
            stored.resource_version = inner.next_version();
            inner.schedules.insert(key, stored.clone());
            stored
        };
        self.emit(ClusterEvent::Schedule {
            kind: EventKind::Upserted,
            namespace: stored.namespace.clone(),
            community: stored.community.clone(),
        });
        Ok(stored)
    }

    async fn update_schedule(
        &self,
        schedule: &CommunitySchedule,
    ) -> StateResult<CommunitySchedule> {
        let stored = {
            let mut inner = self.inner.write().expect("cluster lock");
            let version = inner.next_version();
            let key = (schedule.namespace.clone(), schedule.community.clone());
            let current = inner
                .schedules
                .get_mut(&key)
                .ok_or_else(|| not_found("schedule", schedule.key()))?;
            if current.resource_version != schedule.resource_version {
                return Err(StateError::Conflict(format!(
                    "schedule {} at version {}, update based on {}",
                    schedule.key(),
                    current.resource_version,
                    schedule.resource_version
                )));
            }
            *current = schedule.clone();
            current.resource_version = version;
            current.clone()
        };
        self.emit(ClusterEvent::Schedule {
            kind: EventKind::Upserted,
            namespace: stored.namespace.clone(),
            community: stored.community.clone(),
        });
        Ok(stored)
    }

    async fn delete_schedule(&self, namespace: &str, community: &str) -> StateResult<()> {
        self.inner
            .write()
            .expect("cluster lock")
            .schedules
            .remove(&(namespace.to_string(), community.to_string()))
            .ok_or_else(|| not_found("schedule", format!("{namespace}/{community}")))?;
        self.emit(ClusterEvent::Schedule {
            kind: EventKind::Deleted,
            namespace: namespace.to_string(),
            community: community.to_string(),
        });
        Ok(())
    }

    async fn get_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> StateResult<CommunityConfiguration> {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .configurations
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("configuration", format!("{namespace}/{name}")))
    }

    async fn list_configurations(&self) -> StateResult<Vec<CommunityConfiguration>> {
        let inner = self.inner.read().expect("cluster lock");
        Ok(inner.configurations.values().cloned().collect())
    }

    async fn update_configuration_status(
        &self,
        configuration: &CommunityConfiguration,
    ) -> StateResult<CommunityConfiguration> {
        let mut inner = self.inner.write().expect("cluster lock");
        let version = inner.next_version();
        let current = inner
            .configurations
            .get_mut(&(configuration.namespace.clone(), configuration.name.clone()))
            .ok_or_else(|| not_found("configuration", configuration.key()))?;
        if current.resource_version != configuration.resource_version {
            return Err(StateError::Conflict(format!(
                "configuration {} at version {}, update based on {}",
                configuration.key(),
                current.resource_version,
                configuration.resource_version
            )));
        }
        current.status = configuration.status.clone();
        current.resource_version = version;
        // Status writes do not emit events; they would retrigger the reconciler.
        Ok(current.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
