//! Community reconciler: converge function pods with a CommunitySchedule.
//!
//! One pass is strictly sequential:
//!
//! ```text
//! read schedule + pods ─► plan_sync (pure diff, CPU and GPU separately)
//!        │
//!        ▼
//! create all ─► bind each ─► wait for ready ─┬─ all ready ─► delete stale
//!                                            └─ otherwise ─► keep everything
//! ```
//!
//! Old capacity is only removed once every replacement is ready, including
//! desired pods left unready by an earlier pass. Errors abort the pass; the
//! next pass starts from whatever state was reached.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgegrid_controller::Reconciler;
use edgegrid_core::FunctionKey;
use edgegrid_state::{
    Allocation, ClusterApi, ClusterEvent, CommunitySchedule, FunctionSpec, PodSelector, PodView,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SchedulerResult, split_key};
use crate::pods::build_pod;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A pod to create and the node it must be bound to.
#[derive(Debug, Clone)]
pub struct PlannedPod {
    pub pod: PodView,
    pub node: String,
}

/// Creations and deletions for one pass.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub create: Vec<PlannedPod>,
    pub delete: Vec<PodView>,
    /// Existing pods that satisfy the allocation.
    pub keep: Vec<PodView>,
}

/// What a pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub created: usize,
    pub deleted: usize,
    /// Set when a new pod was not ready in time and deletions were skipped.
    pub deletions_aborted: bool,
}

/// Diff the desired allocation against the community's pods.
pub fn plan_sync(
    schedule: &CommunitySchedule,
    pods: &[PodView],
    functions: &HashMap<FunctionKey, FunctionSpec>,
) -> SchedulerResult<SyncPlan> {
    let mut plan = SyncPlan::default();
    let (gpu_pods, cpu_pods): (Vec<&PodView>, Vec<&PodView>) = pods.iter().partition(|p| p.gpu);

    plan_set(schedule, &schedule.cpu_allocations, &cpu_pods, false, functions, &mut plan)?;
    plan_set(schedule, &schedule.gpu_allocations, &gpu_pods, true, functions, &mut plan)?;
    Ok(plan)
}

fn plan_set(
    schedule: &CommunitySchedule,
    allocation: &Allocation,
    pods: &[&PodView],
    gpu: bool,
    functions: &HashMap<FunctionKey, FunctionSpec>,
    plan: &mut SyncPlan,
) -> SchedulerResult<()> {
    let mut observed: BTreeMap<(FunctionKey, String), &PodView> = BTreeMap::new();
    for pod in pods {
        if !pod.is_running() && pod.deletion_requested {
            continue;
        }
        let Some(node) = &pod.node else {
            // Left unbound by an aborted pass.
            plan.delete.push((*pod).clone());
            continue;
        };
        let key = (pod.function.clone(), node.clone());
        if observed.contains_key(&key) {
            plan.delete.push((*pod).clone());
        } else {
            observed.insert(key, *pod);
        }
    }

    for (function, nodes) in allocation {
        for (node, _) in nodes.iter().filter(|(_, want)| **want) {
            if let Some(pod) = observed.remove(&(function.clone(), node.clone())) {
                plan.keep.push(pod.clone());
                continue;
            }
            let Some(spec) = functions.get(function) else {
                warn!(%function, %node, "allocated function is not registered, skipping");
                continue;
            };
            plan.create.push(PlannedPod {
                pod: build_pod(spec, &schedule.community, node, gpu)?,
                node: node.clone(),
            });
        }
    }

    plan.delete
        .extend(observed.into_values().map(|pod| pod.clone()));
    Ok(())
}

/// Reconciles the pods of every community in one namespace.
pub struct CommunityReconciler {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl CommunityReconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, ready_timeout: Duration) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            ready_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run one reconciliation pass for `community`.
    pub async fn sync_community(&self, community: &str) -> SchedulerResult<SyncOutcome> {
        let schedule = match self.cluster.get_schedule(&self.namespace, community).await {
            Ok(schedule) => schedule,
            Err(e) if e.is_not_found() => {
                debug!(namespace = %self.namespace, %community, "schedule gone, nothing to do");
                return Ok(SyncOutcome::default());
            }
            Err(e) => return Err(e.into()),
        };
        let pods = self
            .cluster
            .list_pods(&PodSelector::community(&self.namespace, community))
            .await?;
        let functions: HashMap<FunctionKey, FunctionSpec> = self
            .cluster
            .list_functions(&self.namespace)
            .await?
            .into_iter()
            .map(|f| (f.key.clone(), f))
            .collect();

        let plan = plan_sync(&schedule, &pods, &functions)?;
        if plan.create.is_empty() && plan.delete.is_empty() {
            debug!(namespace = %self.namespace, %community, "pods match schedule");
            return Ok(SyncOutcome::default());
        }
        info!(
            namespace = %self.namespace,
            %community,
            create = plan.create.len(),
            delete = plan.delete.len(),
            "reconciling community pods"
        );

        let mut outcome = SyncOutcome::default();
        let mut created = Vec::with_capacity(plan.create.len());
        for planned in &plan.create {
            let pod = self.cluster.create_pod(&planned.pod).await?;
            created.push((pod.name, planned.node.clone()));
            outcome.created += 1;
        }
        for (name, node) in &created {
            self.cluster.bind_pod(&self.namespace, name, node).await?;
            debug!(pod = %name, %node, "pod bound");
        }

        // Kept pods still coming up gate deletions like new ones do.
        let mut waiting: Vec<String> = created.iter().map(|(name, _)| name.clone()).collect();
        if !plan.delete.is_empty() {
            waiting.extend(
                plan.keep
                    .iter()
                    .filter(|p| !(p.is_running() && p.ready))
                    .map(|p| p.name.clone()),
            );
        }

        let mut delete = plan.delete;
        if !self.wait_ready(&waiting).await? {
            warn!(
                namespace = %self.namespace,
                %community,
                skipped = delete.len(),
                "new pods not ready, keeping old pods"
            );
            delete.clear();
            outcome.deletions_aborted = true;
        }

        for pod in &delete {
            match self.cluster.delete_pod(&pod.namespace, &pod.name).await {
                Ok(()) => outcome.deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(outcome)
    }

    /// Whether every named pod became ready before the deadline.
    async fn wait_ready(&self, pods: &[String]) -> SchedulerResult<bool> {
        let deadline = Instant::now() + self.ready_timeout;
        for name in pods {
            loop {
                let pod = self.cluster.get_pod(&self.namespace, name).await?;
                if pod.is_running() && pod.ready {
                    break;
                }
                if Instant::now() >= deadline {
                    debug!(pod = %name, phase = ?pod.phase, "pod not ready before deadline");
                    return Ok(false);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Reconciler for CommunityReconciler {
    fn name(&self) -> &'static str {
        "community"
    }

    fn keys_for(&self, event: &ClusterEvent) -> Vec<String> {
        match event {
            ClusterEvent::Schedule {
                namespace,
                community,
                ..
            }
            | ClusterEvent::Pod {
                namespace,
                community,
                ..
            } if *namespace == self.namespace => vec![format!("{namespace}/{community}")],
            _ => Vec::new(),
        }
    }

    async fn initial_keys(&self) -> anyhow::Result<Vec<String>> {
        let schedules = self.cluster.list_schedules(&self.namespace).await?;
        Ok(schedules.iter().map(CommunitySchedule::key).collect())
    }

    async fn reconcile(&self, key: &str) -> anyhow::Result<()> {
        let (_, community) = split_key(key)?;
        let outcome = self.sync_community(community).await?;
        if outcome != SyncOutcome::default() {
            info!(
                %key,
                created = outcome.created,
                deleted = outcome.deleted,
                deletions_aborted = outcome.deletions_aborted,
                "community pass finished"
            );
        }
        Ok(())
    }
}
