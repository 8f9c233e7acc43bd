//! Control plane: the three community controllers.
//!
//! 1. System: partitions workers into communities, labels nodes, keeps one
//!    schedule per community.
//! 2. Scheduling: asks the optimizer for each community's placement on
//!    every scheduler interval.
//! 3. Community: converges function pods with each schedule.

use std::sync::Arc;

use edgegrid_cluster::{PartitionClient, SystemReconciler};
use edgegrid_controller::{Controller, Reconciler};
use edgegrid_core::EdgeConfig;
use edgegrid_scheduler::{CommunityReconciler, SchedulingClient, SchedulingCycle};
use edgegrid_state::{ClusterApi, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::delay_source;

type Task = (&'static str, JoinHandle<anyhow::Result<()>>);

/// Running control plane controllers.
pub struct ControlPlane {
    tasks: Vec<Task>,
}

impl ControlPlane {
    /// Wait for every controller to stop.
    pub async fn join(self) {
        join_tasks(self.tasks).await;
        info!("control plane stopped");
    }
}

pub(crate) async fn join_tasks(tasks: Vec<Task>) {
    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "task failed"),
            Err(e) => error!(task = name, error = %e, "task panicked"),
        }
    }
}

pub(crate) fn spawn_controller<R: Reconciler>(
    controller: Controller<R>,
    cluster: &Arc<dyn ClusterApi>,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<anyhow::Result<()>> {
    let events = cluster.subscribe();
    let shutdown = shutdown.clone();
    tokio::spawn(controller.run(events, shutdown))
}

/// Start the system, scheduling and community controllers.
pub fn spawn_control_plane(
    cluster: Arc<dyn ClusterApi>,
    config: &EdgeConfig,
    store: StateStore,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ControlPlane> {
    let namespace = &config.node.namespace;
    let threadiness = config.controller.threadiness;
    let max_retries = config.controller.max_retries;
    let delays = delay_source(&config.scheduler);

    let system = SystemReconciler::new(
        cluster.clone(),
        PartitionClient::new(&config.partitioner)?,
        delays.clone(),
    );
    let system = Controller::new(Arc::new(system), threadiness, max_retries)
        .with_resync(config.partitioner.resync());

    let cycle = SchedulingCycle::new(
        cluster.clone(),
        SchedulingClient::new(&config.scheduler)?,
        delays,
        namespace,
    )
    .with_workloads(store, config.metrics.window());
    let cycle = Controller::new(Arc::new(cycle), threadiness, max_retries)
        .with_resync(config.scheduler.interval());

    let community = CommunityReconciler::new(
        cluster.clone(),
        namespace,
        config.scheduler.ready_timeout(),
    );
    let community = Controller::new(Arc::new(community), threadiness, max_retries)
        .with_resync(config.scheduler.interval());

    let tasks = vec![
        ("system", spawn_controller(system, &cluster, &shutdown)),
        ("scheduling", spawn_controller(cycle, &cluster, &shutdown)),
        ("community", spawn_controller(community, &cluster, &shutdown)),
    ];
    info!(
        %namespace,
        threadiness,
        optimizer = %config.scheduler.url,
        partitioner = %config.partitioner.url,
        "control plane started"
    );
    Ok(ControlPlane { tasks })
}
