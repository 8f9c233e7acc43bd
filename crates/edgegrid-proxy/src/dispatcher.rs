//! Dispatch controller: request workers and schedule-driven routing.
//!
//! The dispatcher owns one [`LoadBalancer`] per function key. Workers
//! drain the shared [`RequestQueue`]; the [`RoutingReconciler`] keeps each
//! balancer's pool equal to the routing rules of the local node.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use edgegrid_controller::Reconciler;
use edgegrid_core::FunctionKey;
use edgegrid_core::config::{BalancePolicy, DispatcherConfig};
use edgegrid_metrics::{MetricsCollector, ResponseSample};
use edgegrid_state::{
    ClusterApi, ClusterEvent, CommunitySchedule, PodSelector, PodView, RoutingRules,
};
use http::StatusCode;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::balancer::{
    LoadBalancer, PendingRequest, Recovery, UpstreamClient, text_response, upstream_client,
};
use crate::error::{ProxyError, ProxyResult};
use crate::pool::Backend;
use crate::queue::RequestQueue;

/// Calls made by one routing sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl SyncStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

struct DesiredBackend {
    backend: Backend,
    weight: f64,
}

/// Routes queued function calls to per-function load balancers.
pub struct Dispatcher {
    node: String,
    namespace: String,
    cluster: Arc<dyn ClusterApi>,
    queue: Arc<RequestQueue<PendingRequest>>,
    balancers: RwLock<HashMap<FunctionKey, Arc<LoadBalancer>>>,
    client: UpstreamClient,
    samples: Option<mpsc::Sender<ResponseSample>>,
    collector: Option<Arc<MetricsCollector>>,
    dropped: Arc<AtomicU64>,
    workers: usize,
    max_attempts: u32,
    policy: BalancePolicy,
    upstream_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        node: &str,
        namespace: &str,
        config: &DispatcherConfig,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            node: node.to_string(),
            namespace: namespace.to_string(),
            cluster,
            queue: Arc::new(RequestQueue::new()),
            balancers: RwLock::new(HashMap::new()),
            client: upstream_client(),
            samples: None,
            collector: None,
            dropped: Arc::new(AtomicU64::new(0)),
            workers: config.workers.max(1),
            max_attempts: config.max_attempts,
            policy: config.policy,
            upstream_timeout: config.upstream_timeout(),
        }
    }

    /// Report response samples to `samples`; `collector` forgets removed backends.
    pub fn with_metrics(
        mut self,
        samples: mpsc::Sender<ResponseSample>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        self.samples = Some(samples);
        self.collector = Some(collector);
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn queue(&self) -> Arc<RequestQueue<PendingRequest>> {
        self.queue.clone()
    }

    /// Samples dropped because the metrics channel was full.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn balancer(&self, key: &FunctionKey) -> Option<Arc<LoadBalancer>> {
        self.balancers
            .read()
            .expect("balancers lock")
            .get(key)
            .cloned()
    }

    pub fn balancers(&self) -> Vec<Arc<LoadBalancer>> {
        self.balancers
            .read()
            .expect("balancers lock")
            .values()
            .cloned()
            .collect()
    }

    fn balancer_or_create(&self, key: &FunctionKey) -> Arc<LoadBalancer> {
        if let Some(lb) = self.balancer(key) {
            return lb;
        }
        let mut balancers = self.balancers.write().expect("balancers lock");
        balancers
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(function = %key, "load balancer created");
                Arc::new(
                    LoadBalancer::new(
                        key.clone(),
                        self.policy,
                        self.client.clone(),
                        self.samples.clone(),
                        self.dropped.clone(),
                    )
                    .with_limits(self.max_attempts, self.upstream_timeout),
                )
            })
            .clone()
    }

    /// Failed attempts go back to the end of the queue.
    fn recovery(&self) -> Recovery {
        let queue = self.queue.clone();
        Arc::new(move |req: PendingRequest| {
            if let Err(req) = queue.enqueue(req) {
                req.respond(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "dispatcher shutting down",
                ));
            }
        })
    }

    /// Hand one request to its function's balancer.
    pub async fn dispatch(&self, req: PendingRequest) {
        match self.balancer(&req.function) {
            Some(lb) => lb.balance(req).await,
            None => {
                let err = ProxyError::Unroutable(req.function.to_string());
                warn!(function = %req.function, error = %err, "unroutable request");
                req.respond(text_response(StatusCode::NOT_FOUND, &err.to_string()));
            }
        }
    }

    /// Run the dispatch workers until shutdown, then drain the queue.
    pub async fn run_workers(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    while let Some(req) = dispatcher.queue.next().await {
                        dispatcher.dispatch(req).await;
                    }
                    debug!(worker = id, "dispatch worker stopped");
                })
            })
            .collect();
        info!(workers = self.workers, node = %self.node, "dispatch workers started");

        let _ = shutdown.changed().await;
        self.queue.close();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatch worker panicked");
            }
        }
        info!("dispatch workers stopped");
    }

    /// Converge every balancer's pool with the local node's routing rules.
    pub async fn sync_routing(&self) -> ProxyResult<SyncStats> {
        let local = self.cluster.get_node(&self.node).await?;
        let mut desired: BTreeMap<FunctionKey, BTreeMap<String, DesiredBackend>> = BTreeMap::new();

        let registered: HashSet<FunctionKey> = self
            .cluster
            .list_functions(&self.namespace)
            .await?
            .into_iter()
            .map(|f| f.key)
            .collect();
        for key in &registered {
            desired.entry(key.clone()).or_default();
        }
        // Balancers that fell out of both sets converge to an empty pool.
        for key in self.balancers.read().expect("balancers lock").keys() {
            desired.entry(key.clone()).or_default();
        }

        if let Some(community) = &local.community {
            let schedule = match self.cluster.get_schedule(&self.namespace, community).await {
                Ok(schedule) => schedule,
                Err(e) if e.is_not_found() => CommunitySchedule::empty(&self.namespace, community),
                Err(e) => return Err(e.into()),
            };
            let pods = self
                .cluster
                .list_pods(&PodSelector::community(&self.namespace, community))
                .await?;
            self.collect_desired(&schedule.cpu_routing_rules, false, &pods, community, &mut desired)?;
            self.collect_desired(&schedule.gpu_routing_rules, true, &pods, community, &mut desired)?;
        }

        let mut stats = SyncStats::default();
        let mut retired = Vec::new();
        for (key, backends) in desired {
            let lb = self.balancer_or_create(&key);
            let urls: Vec<&str> = backends.keys().map(String::as_str).collect();

            for url in lb.server_pool_diff(&urls) {
                lb.delete_server(&url)?;
                if let Some(collector) = &self.collector {
                    collector.remove_backend(&key, &url);
                }
                stats.removed += 1;
            }
            for (url, target) in backends {
                match lb.weight(&url) {
                    Some(w) if w == target.weight => {}
                    Some(_) => {
                        lb.update_workload(&url, target.weight)?;
                        stats.updated += 1;
                    }
                    None => {
                        lb.add_server(target.backend, target.weight, self.recovery());
                        stats.added += 1;
                    }
                }
            }
            if !registered.contains(&key) && lb.pool().is_empty() {
                retired.push(key);
            }
        }

        if !retired.is_empty() {
            let mut balancers = self.balancers.write().expect("balancers lock");
            for key in &retired {
                balancers.remove(key);
                debug!(function = %key, "load balancer retired");
            }
        }

        if stats.is_noop() {
            debug!(node = %self.node, "routing unchanged");
        } else {
            info!(
                node = %self.node,
                added = stats.added,
                removed = stats.removed,
                updated = stats.updated,
                "routing synced"
            );
        }
        Ok(stats)
    }

    fn collect_desired(
        &self,
        rules: &RoutingRules,
        gpu: bool,
        pods: &[PodView],
        community: &str,
        desired: &mut BTreeMap<FunctionKey, BTreeMap<String, DesiredBackend>>,
    ) -> ProxyResult<()> {
        let Some(destinations) = rules.get(&self.node) else {
            return Ok(());
        };
        for (dest, functions) in destinations {
            for (function, &weight) in functions {
                if weight <= 0.0 {
                    continue;
                }
                let serving = pods.iter().filter(|p| {
                    &p.function == function
                        && p.node.as_deref() == Some(dest.as_str())
                        && p.gpu == gpu
                        && p.is_running()
                        && p.ready
                        && !p.deletion_requested
                });
                for pod in serving {
                    let Some(url) = pod.endpoint_url() else {
                        continue;
                    };
                    let backend = Backend::new(&url, dest, community, gpu)?;
                    desired
                        .entry(function.clone())
                        .or_default()
                        .insert(url, DesiredBackend { backend, weight });
                }
            }
        }
        Ok(())
    }
}

/// Key under which every routing-relevant event is coalesced.
const ROUTING_KEY: &str = "routing";

/// Runs [`Dispatcher::sync_routing`] whenever schedules, pods or the
/// local node change.
pub struct RoutingReconciler {
    dispatcher: Arc<Dispatcher>,
}

impl RoutingReconciler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Reconciler for RoutingReconciler {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn keys_for(&self, event: &ClusterEvent) -> Vec<String> {
        let relevant = match event {
            ClusterEvent::Schedule { namespace, .. } | ClusterEvent::Pod { namespace, .. } => {
                namespace == self.dispatcher.namespace()
            }
            ClusterEvent::Function { key, .. } => key.namespace == self.dispatcher.namespace(),
            ClusterEvent::Node { name, .. } => name == self.dispatcher.node(),
            ClusterEvent::Configuration { .. } => false,
        };
        if relevant {
            vec![ROUTING_KEY.to_string()]
        } else {
            Vec::new()
        }
    }

    async fn initial_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![ROUTING_KEY.to_string()])
    }

    async fn reconcile(&self, _key: &str) -> anyhow::Result<()> {
        self.dispatcher.sync_routing().await?;
        Ok(())
    }
}
