//! Label encoding at the cluster boundary.
//!
//! Community membership, roles and pod ownership are plain string labels
//! on cluster objects. Everything above the boundary works with the typed
//! fields on `NodeView`/`PodView`; only this module knows the label keys.

use std::collections::BTreeMap;

use crate::types::{PodView, Role};

pub const COMMUNITY: &str = "edgegrid.io/community";
pub const ROLE: &str = "edgegrid.io/community-role";
pub const GPU_MEMORY: &str = "edgegrid.io/gpu-memory";
pub const MASTER: &str = "node-role.kubernetes.io/master";
pub const CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

pub const FUNCTION: &str = "edgegrid.io/function";
pub const FUNCTION_NAMESPACE: &str = "edgegrid.io/function-namespace";
pub const NODE: &str = "edgegrid.io/node";
pub const GPU: &str = "edgegrid.io/gpu";

/// Relations decoded from a node's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRelations {
    pub community: Option<String>,
    pub role: Option<Role>,
    pub gpu_memory_bytes: Option<u64>,
    pub master: bool,
}

/// Split node labels into typed relations and the remaining raw labels.
///
/// Community and role labels are owned by the control plane and removed
/// from the returned map; master and GPU labels are read-only and stay.
pub fn decode_node(labels: &BTreeMap<String, String>) -> (NodeRelations, BTreeMap<String, String>) {
    let mut rest = labels.clone();
    let community = rest.remove(COMMUNITY).filter(|c| !c.is_empty());
    let role = rest.remove(ROLE).and_then(|r| r.parse().ok());
    let gpu_memory_bytes = labels.get(GPU_MEMORY).and_then(|v| v.parse().ok());
    let master = labels.contains_key(MASTER) || labels.contains_key(CONTROL_PLANE);

    (
        NodeRelations {
            community,
            role,
            gpu_memory_bytes,
            master,
        },
        rest,
    )
}

/// Rebuild a node's full label set from its raw labels and typed relations.
pub fn encode_node(
    rest: &BTreeMap<String, String>,
    community: Option<&str>,
    role: Option<Role>,
) -> BTreeMap<String, String> {
    let mut labels = rest.clone();
    labels.remove(COMMUNITY);
    labels.remove(ROLE);
    if let Some(community) = community {
        labels.insert(COMMUNITY.to_string(), community.to_string());
    }
    if let Some(role) = role {
        labels.insert(ROLE.to_string(), role.as_str().to_string());
    }
    labels
}

/// Ownership labels stamped on every function pod.
pub fn pod_labels(pod: &PodView) -> BTreeMap<String, String> {
    let mut labels = pod.labels.clone();
    labels.insert(FUNCTION.to_string(), pod.function.name.clone());
    labels.insert(FUNCTION_NAMESPACE.to_string(), pod.function.namespace.clone());
    labels.insert(COMMUNITY.to_string(), pod.community.clone());
    labels.insert(GPU.to_string(), pod.gpu.to_string());
    if let Some(node) = &pod.node {
        labels.insert(NODE.to_string(), node.clone());
    }
    labels
}
