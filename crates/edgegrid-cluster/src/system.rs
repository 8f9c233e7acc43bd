//! System reconciler: partitions worker nodes into communities and keeps
//! node community/role labels in line with the partition.
//!
//! ```text
//! CommunityConfiguration upsert
//!   ├── ready workers + delay matrix ─► PartitionClient ─► communities
//!   ├── target (community, role) per node; absent nodes cleared
//!   ├── update_node only where labels differ
//!   ├── create empty schedules for new communities, delete vanished ones
//!   └── status.communities = names
//!
//! CommunityConfiguration delete
//!   └── clear every node's labels, delete the namespace's schedules
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use edgegrid_controller::Reconciler;
use edgegrid_state::{
    ClusterApi, ClusterEvent, CommunityConfiguration, CommunitySchedule, DelaySource, NodeSelector,
    NodeView, Role, StateError, labels,
};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::partition::{PartitionClient, PartitionRequest, PartitionedCommunity};

/// Writes made by one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub labelled: usize,
    pub cleared: usize,
    pub schedules_created: usize,
    pub schedules_deleted: usize,
}

/// Community and role a node should carry.
type Target = BTreeMap<String, (String, Role)>;

pub struct SystemReconciler {
    cluster: Arc<dyn ClusterApi>,
    client: PartitionClient,
    delays: Arc<dyn DelaySource>,
}

impl SystemReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        client: PartitionClient,
        delays: Arc<dyn DelaySource>,
    ) -> Self {
        Self {
            cluster,
            client,
            delays,
        }
    }

    /// Partition and label for an existing configuration.
    pub async fn apply(&self, config: &CommunityConfiguration) -> ClusterResult<ApplyOutcome> {
        let mut workers = self.cluster.list_nodes(&NodeSelector::workers()).await?;
        workers.sort_by(|a, b| a.name.cmp(&b.name));

        let communities = if workers.is_empty() {
            debug!(config = %config.key(), "no ready workers to partition");
            Vec::new()
        } else {
            let names: Vec<String> = workers.iter().map(|n| n.name.clone()).collect();
            let request = PartitionRequest::new(
                config.parameters.clone(),
                &workers,
                &self.delays.matrix(&names),
            );
            self.client.communities(&request).await?
        };

        let all = self.cluster.list_nodes(&NodeSelector::all()).await?;
        let target = assign_roles(&communities, &all);

        let mut outcome = ApplyOutcome::default();
        for node in &all {
            let desired = target.get(&node.name).map(|(c, r)| (Some(c.as_str()), Some(*r)));
            let (community, role) = desired.unwrap_or((None, None));
            if node.community.as_deref() == community && node.role == role {
                continue;
            }
            self.write_labels(node, community, role).await?;
            if community.is_some() {
                outcome.labelled += 1;
            } else {
                outcome.cleared += 1;
            }
        }

        let names: BTreeSet<String> = communities
            .iter()
            .filter(|c| c.members.iter().any(|m| target.contains_key(&m.name)))
            .map(|c| c.name.clone())
            .collect();
        self.sync_schedules(&config.namespace, &names, &mut outcome)
            .await?;

        let listed: Vec<String> = names.into_iter().collect();
        if config.status.communities != listed {
            let mut updated = config.clone();
            updated.status.communities = listed;
            self.cluster.update_configuration_status(&updated).await?;
        }

        info!(
            config = %config.key(),
            communities = communities.len(),
            labelled = outcome.labelled,
            cleared = outcome.cleared,
            "partition applied"
        );
        Ok(outcome)
    }

    /// Clear community labels everywhere and drop the namespace's schedules.
    pub async fn cleanup(&self, namespace: &str) -> ClusterResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        for node in self.cluster.list_nodes(&NodeSelector::all()).await? {
            if node.community.is_none() && node.role.is_none() {
                continue;
            }
            self.write_labels(&node, None, None).await?;
            outcome.cleared += 1;
        }
        self.sync_schedules(namespace, &BTreeSet::new(), &mut outcome)
            .await?;
        info!(%namespace, cleared = outcome.cleared, "community configuration removed");
        Ok(outcome)
    }

    async fn write_labels(
        &self,
        node: &NodeView,
        community: Option<&str>,
        role: Option<Role>,
    ) -> ClusterResult<()> {
        let mut updated = node.clone();
        updated.community = community.map(str::to_string);
        updated.role = role;
        self.cluster.update_node(&updated).await?;
        debug!(node = %node.name, ?community, ?role, "node labels updated");
        Ok(())
    }

    async fn sync_schedules(
        &self,
        namespace: &str,
        names: &BTreeSet<String>,
        outcome: &mut ApplyOutcome,
    ) -> ClusterResult<()> {
        let existing = self.cluster.list_schedules(namespace).await?;
        let existing_names: BTreeSet<&str> =
            existing.iter().map(|s| s.community.as_str()).collect();

        for name in names {
            if existing_names.contains(name.as_str()) {
                continue;
            }
            match self
                .cluster
                .create_schedule(&CommunitySchedule::empty(namespace, name))
                .await
            {
                Ok(_) => outcome.schedules_created += 1,
                Err(StateError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        for schedule in &existing {
            if names.contains(&schedule.community) {
                continue;
            }
            match self
                .cluster
                .delete_schedule(namespace, &schedule.community)
                .await
            {
                Ok(()) => outcome.schedules_deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Pick one leader per community.
///
/// A node already leading the same community keeps the role; otherwise a
/// member the partitioner marked as leader wins; otherwise the first
/// member leads. Members unknown to the cluster are ignored.
fn assign_roles(communities: &[PartitionedCommunity], nodes: &[NodeView]) -> Target {
    let by_name: BTreeMap<&str, &NodeView> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();
    let mut target = Target::new();

    for community in communities {
        let members: Vec<_> = community
            .members
            .iter()
            .filter(|m| {
                let known = by_name.contains_key(m.name.as_str());
                if !known {
                    warn!(community = %community.name, node = %m.name, "partition names an unknown node");
                }
                known && !target.contains_key(&m.name)
            })
            .collect();
        if members.is_empty() {
            continue;
        }

        let current_leader = members.iter().find(|m| {
            by_name.get(m.name.as_str()).is_some_and(|n| {
                n.community.as_deref() == Some(community.name.as_str()) && n.role == Some(Role::Leader)
            })
        });
        let suggested = members.iter().find(|m| {
            m.labels
                .get(labels::ROLE)
                .and_then(|r| r.parse::<Role>().ok())
                == Some(Role::Leader)
        });
        let leader = current_leader
            .or(suggested)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| members[0].name.clone());

        for member in members {
            let role = if member.name == leader {
                Role::Leader
            } else {
                Role::Member
            };
            target.insert(member.name.clone(), (community.name.clone(), role));
        }
    }
    target
}

/// Reconcile key is `namespace/name` of a CommunityConfiguration.
#[async_trait]
impl Reconciler for SystemReconciler {
    fn name(&self) -> &'static str {
        "system"
    }

    fn keys_for(&self, event: &ClusterEvent) -> Vec<String> {
        match event {
            ClusterEvent::Configuration {
                namespace, name, ..
            } => vec![format!("{namespace}/{name}")],
            _ => Vec::new(),
        }
    }

    async fn initial_keys(&self) -> anyhow::Result<Vec<String>> {
        let configs = self.cluster.list_configurations().await?;
        Ok(configs.iter().map(CommunityConfiguration::key).collect())
    }

    async fn reconcile(&self, key: &str) -> anyhow::Result<()> {
        let (namespace, name) = key
            .split_once('/')
            .ok_or_else(|| ClusterError::InvalidKey(key.to_string()))?;
        match self.cluster.get_configuration(namespace, name).await {
            Ok(config) => {
                self.apply(&config).await?;
            }
            Err(e) if e.is_not_found() => {
                self.cleanup(namespace).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
