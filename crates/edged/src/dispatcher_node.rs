//! Dispatcher node: request front door, load balancers and the metrics
//! pipeline behind them.
//!
//! ```text
//! DispatchServer ─► RequestQueue ─► dispatch workers ─► LoadBalancer
//!                                                          │ samples
//!                                                          ▼
//!                         StateStore ◄─ Persister ◄─ MetricsCollector
//!                                           ▲
//!                                           └─ ResourceSampler
//! ```
//!
//! Shutdown stops the listener and workers first; the collector drains
//! the samples already queued, then the persister flushes what it holds.

use std::sync::Arc;
use std::time::Duration;

use edgegrid_controller::Controller;
use edgegrid_core::EdgeConfig;
use edgegrid_metrics::{MetricsCollector, PersistConfig, Persister, ResourceSampler};
use edgegrid_proxy::{DispatchServer, Dispatcher, HealthProber, RoutingReconciler};
use edgegrid_state::{ClusterApi, SampleSink, StateStore};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::control_plane::{join_tasks, spawn_controller};

/// How long shutdown waits for the persister to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Running dispatcher and its metrics pipeline.
pub struct DispatcherNode {
    pub dispatcher: Arc<Dispatcher>,
    pub collector: Arc<MetricsCollector>,
    persister: Persister,
    tasks: Vec<(&'static str, tokio::task::JoinHandle<anyhow::Result<()>>)>,
}

impl DispatcherNode {
    /// Wait for the dispatcher to stop and the sample store to be flushed.
    ///
    /// Every other clone of `dispatcher` and `collector` must be dropped
    /// first, or the flush waits for [`FLUSH_TIMEOUT`].
    pub async fn join(self) -> u64 {
        let Self {
            dispatcher,
            collector,
            persister,
            tasks,
        } = self;
        join_tasks(tasks).await;
        drop(dispatcher);
        drop(collector);

        match tokio::time::timeout(FLUSH_TIMEOUT, persister.join()).await {
            Ok(written) => {
                info!(written, "dispatcher node stopped");
                written
            }
            Err(_) => {
                warn!("sample persister did not flush in time");
                0
            }
        }
    }
}

/// Start the dispatcher on `listener` for `config.node.name`.
pub fn spawn_dispatcher(
    cluster: Arc<dyn ClusterApi>,
    config: &EdgeConfig,
    store: StateStore,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<DispatcherNode> {
    let node = &config.node.name;
    let metrics = &config.metrics;

    let sink: Arc<dyn SampleSink> = Arc::new(store);
    let (persist, persister) = Persister::spawn(sink, PersistConfig::from_config(metrics));
    let sampler = metrics.resource_interval().map(|interval| {
        ResourceSampler::new(
            node.clone(),
            config.node.namespace.clone(),
            cluster.clone(),
            persist.clone(),
            interval,
        )
    });
    let collector = Arc::new(MetricsCollector::new(
        node.clone(),
        metrics.window(),
        metrics.granularity(),
        Some(persist),
    ));

    let (samples_tx, samples_rx) = mpsc::channel(config.dispatcher.metrics_buffer.max(1));
    let dispatcher = Arc::new(
        Dispatcher::new(
            node,
            &config.node.namespace,
            &config.dispatcher,
            cluster.clone(),
        )
        .with_metrics(samples_tx, collector.clone()),
    );

    let mut tasks = Vec::new();

    let routing = Controller::new(
        Arc::new(RoutingReconciler::new(dispatcher.clone())),
        1,
        config.controller.max_retries,
    )
    .with_resync(config.scheduler.interval());
    tasks.push(("routing", spawn_controller(routing, &cluster, &shutdown)));

    let server = DispatchServer::new(listener.local_addr()?, dispatcher.clone());
    tasks.push((
        "dispatch-server",
        tokio::spawn(server.serve_listener(listener, shutdown.clone())),
    ));

    let workers = dispatcher.clone();
    let worker_shutdown = shutdown.clone();
    tasks.push((
        "dispatch-workers",
        tokio::spawn(async move {
            workers.run_workers(worker_shutdown).await;
            Ok(())
        }),
    ));

    let drain = collector.clone();
    let collector_shutdown = shutdown.clone();
    tasks.push((
        "metrics-collector",
        tokio::spawn(async move {
            drain.run(samples_rx, collector_shutdown).await;
            Ok(())
        }),
    ));

    if let Some(sampler) = sampler {
        let sampler_shutdown = shutdown.clone();
        tasks.push((
            "resource-sampler",
            tokio::spawn(async move {
                sampler.run(sampler_shutdown).await;
                Ok(())
            }),
        ));
    }

    if let Some(interval) = config.dispatcher.health_probe_interval() {
        let prober = HealthProber::new(dispatcher.clone(), interval, interval / 2);
        let prober_shutdown = shutdown.clone();
        tasks.push((
            "health-prober",
            tokio::spawn(async move {
                prober.run(prober_shutdown).await;
                Ok(())
            }),
        ));
    }

    info!(
        %node,
        namespace = %config.node.namespace,
        workers = config.dispatcher.workers,
        policy = ?config.dispatcher.policy,
        "dispatcher node started"
    );
    Ok(DispatcherNode {
        dispatcher,
        collector,
        persister,
        tasks,
    })
}
