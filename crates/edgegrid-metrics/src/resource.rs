//! Periodic CPU observations for the pods on this node.
//!
//! Every interval the sampler lists the namespace's pods, keeps the ones
//! bound to the local node and serving, and persists one
//! `RawResourceData` row per pod. Cores are taken from the pod's CPU
//! request.

use std::sync::Arc;
use std::time::Duration;

use edgegrid_state::{ClusterApi, PodSelector, RawResourceData, StateResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::collector::epoch_millis;
use crate::persist::{PersistError, PersistHandle, Sample};

pub struct ResourceSampler {
    node: String,
    namespace: String,
    cluster: Arc<dyn ClusterApi>,
    persist: PersistHandle,
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(
        node: impl Into<String>,
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        persist: PersistHandle,
        interval: Duration,
    ) -> Self {
        Self {
            node: node.into(),
            namespace: namespace.into(),
            cluster,
            persist,
            interval,
        }
    }

    /// Current rows for the serving pods on this node, sorted by pod name.
    pub async fn observe(&self) -> StateResult<Vec<RawResourceData>> {
        let mut pods = self
            .cluster
            .list_pods(&PodSelector::namespace(&self.namespace))
            .await?;
        pods.retain(|p| {
            p.node.as_deref() == Some(self.node.as_str())
                && p.is_running()
                && p.ready
                && !p.deletion_requested
        });
        pods.sort_by(|a, b| a.name.cmp(&b.name));

        let timestamp_ms = epoch_millis();
        Ok(pods
            .into_iter()
            .map(|p| RawResourceData {
                timestamp_ms,
                node: self.node.clone(),
                function: p.function.name,
                namespace: p.function.namespace,
                community: p.community,
                cores: p.requests.cpu_millis as f64 / 1000.0,
            })
            .collect())
    }

    /// Observe once and queue the rows. Returns the number queued.
    pub async fn sample_once(&self) -> Result<usize, PersistError> {
        let rows = self.observe().await?;
        let count = rows.len();
        for row in rows {
            self.persist.send(Sample::Resource(row)).await?;
        }
        Ok(count)
    }

    /// Sample every interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node = %self.node,
            interval_secs = self.interval.as_secs(),
            "resource sampler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sample_once().await {
                    Ok(rows) => debug!(rows, "resource sample queued"),
                    Err(PersistError::Closed) => break,
                    Err(e) => warn!(error = %e, "resource sample failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("resource sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{PersistConfig, Persister};
    use edgegrid_core::FunctionKey;
    use edgegrid_state::{
        MemoryCluster, NodeView, PodPhase, PodView, Resources, SampleSink, StateStore,
    };

    const NS: &str = "ns";

    fn node(name: &str) -> NodeView {
        NodeView {
            name: name.into(),
            address: "10.0.0.1".into(),
            capacity_memory_bytes: 1 << 30,
            capacity_cpu_millis: 4000,
            gpu_memory_bytes: None,
            community: Some("c-0".into()),
            role: None,
            ready: true,
            master: false,
            labels: Default::default(),
            resource_version: 0,
        }
    }

    fn pod(name: &str, function: &str, cpu_millis: u64) -> PodView {
        PodView {
            namespace: NS.into(),
            name: name.into(),
            function: FunctionKey::new(NS, function),
            community: "c-0".into(),
            node: None,
            gpu: false,
            phase: PodPhase::Pending,
            ready: false,
            deletion_requested: false,
            ip: None,
            port: 8080,
            image: String::new(),
            env: Default::default(),
            requests: Resources {
                cpu_millis,
                ..Resources::default()
            },
            limits: Resources::default(),
            labels: Default::default(),
            resource_version: 0,
        }
    }

    async fn cluster() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::new(true));
        cluster.insert_node(node("node-a"));
        cluster.insert_node(node("node-b"));
        cluster.create_pod(&pod("resize-1", "resize", 500)).await.unwrap();
        cluster.bind_pod(NS, "resize-1", "node-a").await.unwrap();
        cluster.create_pod(&pod("thumb-1", "thumb", 250)).await.unwrap();
        cluster.bind_pod(NS, "thumb-1", "node-b").await.unwrap();
        // Created but never bound.
        cluster.create_pod(&pod("resize-2", "resize", 500)).await.unwrap();
        cluster
    }

    fn persister(store: &StateStore) -> (PersistHandle, Persister) {
        let sink: Arc<dyn SampleSink> = Arc::new(store.clone());
        Persister::spawn(
            sink,
            PersistConfig {
                batch_size: 10,
                workers: 1,
                buffer: 16,
            },
        )
    }

    #[tokio::test]
    async fn only_serving_local_pods_are_observed() {
        let store = StateStore::open_in_memory().unwrap();
        let (handle, _persister) = persister(&store);
        let sampler = ResourceSampler::new(
            "node-a",
            NS,
            cluster().await,
            handle,
            Duration::from_secs(1),
        );

        let rows = sampler.observe().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].node, "node-a");
        assert_eq!(rows[0].function, "resize");
        assert_eq!(rows[0].namespace, NS);
        assert_eq!(rows[0].community, "c-0");
        assert!((rows[0].cores - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn samples_reach_the_store() {
        let store = StateStore::open_in_memory().unwrap();
        let (handle, persister) = persister(&store);
        let sampler = ResourceSampler::new(
            "node-b",
            NS,
            cluster().await,
            handle,
            Duration::from_secs(1),
        );

        assert_eq!(sampler.sample_once().await.unwrap(), 1);
        drop(sampler);
        assert_eq!(persister.join().await, 1);

        let data = store.list_resource_data_since(0).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].function, "thumb");
        assert!((data[0].cores - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let (handle, _persister) = persister(&store);
        let sampler = ResourceSampler::new(
            "node-a",
            NS,
            cluster().await,
            handle,
            Duration::from_secs(60),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sampler.run(stop_rx));
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
