//! Periodic scheduling cycle: gather inputs, ask the optimizer, write the
//! community's schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgegrid_controller::Reconciler;
use edgegrid_state::{
    ClusterApi, ClusterEvent, CommunitySchedule, DelaySource, FunctionSpec, NodeSelector,
    NodeView, StateStore,
};
use tracing::{debug, info, warn};

use crate::client::{SchedulingClient, SchedulingInput};
use crate::error::{SchedulerResult, split_key};

/// Result of one tick for one community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The schedule was rewritten.
    Written,
    /// Nothing to schedule (no ready nodes or no functions).
    Skipped,
    /// Someone else updated the schedule first; retried next tick.
    Conflict,
}

/// Computes one community's schedule per tick.
pub struct SchedulingCycle {
    cluster: Arc<dyn ClusterApi>,
    client: SchedulingClient,
    delays: Arc<dyn DelaySource>,
    store: Option<StateStore>,
    namespace: String,
    window: Duration,
}

impl SchedulingCycle {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        client: SchedulingClient,
        delays: Arc<dyn DelaySource>,
        namespace: &str,
    ) -> Self {
        Self {
            cluster,
            client,
            delays,
            store: None,
            namespace: namespace.to_string(),
            window: Duration::from_secs(60),
        }
    }

    /// Read workloads from `store` over the trailing `window`.
    pub fn with_workloads(mut self, store: StateStore, window: Duration) -> Self {
        self.store = Some(store);
        self.window = window;
        self
    }

    /// `nodes × functions` request counts over the window; zeros without a store.
    fn workload_matrix(
        &self,
        nodes: &[NodeView],
        functions: &[FunctionSpec],
    ) -> SchedulerResult<Vec<Vec<i64>>> {
        let counts = match &self.store {
            Some(store) => {
                let since = now_ms().saturating_sub(self.window.as_millis() as u64);
                store.count_requests_since(since)?
            }
            None => Default::default(),
        };
        Ok(nodes
            .iter()
            .map(|node| {
                functions
                    .iter()
                    .map(|f| {
                        let count = counts
                            .get(&(node.name.clone(), f.key.to_string()))
                            .copied()
                            .unwrap_or(0);
                        i64::try_from(count).unwrap_or(i64::MAX)
                    })
                    .collect()
            })
            .collect())
    }

    /// Run one scheduling round for `community`.
    pub async fn run_once(&self, community: &str) -> SchedulerResult<CycleOutcome> {
        let mut nodes: Vec<NodeView> = self
            .cluster
            .list_nodes(&NodeSelector::in_community(community))
            .await?
            .into_iter()
            .filter(|n| n.ready)
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        let mut functions = self.cluster.list_functions(&self.namespace).await?;
        functions.sort_by(|a, b| a.key.cmp(&b.key));

        if nodes.is_empty() || functions.is_empty() {
            debug!(
                namespace = %self.namespace,
                %community,
                nodes = nodes.len(),
                functions = functions.len(),
                "nothing to schedule"
            );
            return Ok(CycleOutcome::Skipped);
        }

        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let input = SchedulingInput::new(
            &nodes,
            &functions,
            self.delays.matrix(&names),
            self.workload_matrix(&nodes, &functions)?,
            functions.iter().map(|f| f.max_delay_ms).collect(),
        )?;
        let output = self.client.schedule(&input).await?;

        let result = match self.cluster.get_schedule(&self.namespace, community).await {
            Ok(mut schedule) => {
                output.apply_to(&mut schedule);
                self.cluster.update_schedule(&schedule).await
            }
            Err(e) if e.is_not_found() => {
                let mut schedule = CommunitySchedule::empty(&self.namespace, community);
                output.apply_to(&mut schedule);
                self.cluster.create_schedule(&schedule).await
            }
            Err(e) => return Err(e.into()),
        };
        match result {
            Ok(_) => {
                info!(
                    namespace = %self.namespace,
                    %community,
                    nodes = nodes.len(),
                    functions = functions.len(),
                    "schedule written"
                );
                Ok(CycleOutcome::Written)
            }
            Err(e) if e.is_conflict() => {
                warn!(namespace = %self.namespace, %community, error = %e, "schedule changed concurrently");
                Ok(CycleOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Ticks are driven by the controller's resync period, not by events:
/// schedule writes would otherwise retrigger the cycle.
#[async_trait]
impl Reconciler for SchedulingCycle {
    fn name(&self) -> &'static str {
        "scheduling"
    }

    fn keys_for(&self, _event: &ClusterEvent) -> Vec<String> {
        Vec::new()
    }

    async fn initial_keys(&self) -> anyhow::Result<Vec<String>> {
        let schedules = self.cluster.list_schedules(&self.namespace).await?;
        Ok(schedules.iter().map(CommunitySchedule::key).collect())
    }

    async fn reconcile(&self, key: &str) -> anyhow::Result<()> {
        let (_, community) = split_key(key)?;
        self.run_once(community).await?;
        Ok(())
    }
}
