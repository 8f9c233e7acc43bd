//! Opt-in TCP liveness probing of balancer backends.
//!
//! A backend that refuses connections is marked dead and skipped by
//! `next_backend` until a later sweep reaches it again. Pool membership is
//! never changed here; that stays with routing sync.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

/// Whether a TCP connection to `addr` opens within `timeout`.
pub async fn tcp_probe(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "probe connection failed");
            false
        }
        Err(_) => {
            debug!(%addr, "probe timed out");
            false
        }
    }
}

/// Periodically probes every backend of every balancer.
pub struct HealthProber {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration, timeout: Duration) -> Self {
        Self {
            dispatcher,
            interval,
            timeout,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "backend health prober started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    info!("backend health prober stopped");
                    return;
                }
            }
        }
    }

    /// Probe once. Returns how many backends changed state.
    pub async fn sweep(&self) -> usize {
        let mut changed = 0;
        for lb in self.dispatcher.balancers() {
            for backend in lb.pool().backends() {
                let alive = tcp_probe(&backend.socket_addr(), self.timeout).await;
                match lb.pool().set_alive(&backend.url, alive) {
                    Some(previous) if previous != alive => {
                        changed += 1;
                        if alive {
                            info!(function = %lb.function(), url = %backend.url, "backend back up");
                        } else {
                            warn!(function = %lb.function(), url = %backend.url, "backend unreachable");
                        }
                    }
                    _ => {}
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::tests::{closed_port, echo_upstream};
    use crate::balancer::{PendingRequest, Recovery};
    use crate::pool::Backend;
    use edgegrid_core::FunctionKey;
    use edgegrid_core::config::DispatcherConfig;
    use edgegrid_state::{FunctionSpec, MemoryCluster, Resources};

    #[tokio::test]
    async fn probe_reports_reachability() {
        let open = echo_upstream().await;
        let closed = closed_port().await;
        assert!(tcp_probe(&open.to_string(), Duration::from_secs(1)).await);
        assert!(!tcp_probe(&closed.to_string(), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn sweep_marks_dead_backends() {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.insert_function(FunctionSpec {
            key: FunctionKey::new("ns", "echo"),
            image: "echo:1".to_string(),
            env: Default::default(),
            port: 8080,
            requests: Resources::default(),
            limits: Resources::default(),
            gpu: false,
            max_delay_ms: 100,
        });
        let node = edgegrid_state::NodeView {
            name: "node-1".to_string(),
            address: "127.0.0.1".to_string(),
            capacity_memory_bytes: 1 << 30,
            capacity_cpu_millis: 1000,
            gpu_memory_bytes: None,
            community: None,
            role: None,
            ready: true,
            master: false,
            labels: Default::default(),
            resource_version: 0,
        };
        cluster.insert_node(node);
        let dispatcher = Arc::new(Dispatcher::new(
            "node-1",
            "ns",
            &DispatcherConfig::default(),
            cluster,
        ));
        dispatcher.sync_routing().await.unwrap();
        let lb = dispatcher.balancer(&FunctionKey::new("ns", "echo")).unwrap();

        let open = echo_upstream().await;
        let closed = closed_port().await;
        let noop: Recovery = Arc::new(|_req: PendingRequest| {});
        for addr in [open, closed] {
            let backend = Backend::new(&format!("http://{addr}"), "node-1", "c-0", false).unwrap();
            lb.add_server(backend, 1.0, noop.clone());
        }

        let prober = HealthProber::new(dispatcher.clone(), Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(prober.sweep().await, 1);
        assert_eq!(lb.pool().next_backend().unwrap().url, format!("http://{open}"));
        assert_eq!(prober.sweep().await, 0);
    }
}
