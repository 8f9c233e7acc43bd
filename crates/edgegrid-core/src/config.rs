//! edged.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub node: NodeConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub partitioner: PartitionerConfig,
    pub metrics: MetricsConfig,
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of the node this process runs on (source node for routing rules).
    pub name: String,
    /// Namespace that holds functions, schedules and the community configuration.
    pub namespace: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "standalone".to_string(),
            namespace: "openfaas-fn".to_string(),
        }
    }
}

/// Backend selection policy for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    RoundRobin,
    #[default]
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub listen: SocketAddr,
    /// Number of dispatch workers draining the request queue.
    pub workers: usize,
    /// Attempts per request before answering 502.
    pub max_attempts: u32,
    /// Capacity of the balancer → collector sample channel.
    pub metrics_buffer: usize,
    pub policy: BalancePolicy,
    /// Upstream request timeout in seconds.
    pub upstream_timeout_secs: u64,
    /// TCP health probe interval in seconds. Probing is disabled when unset.
    pub health_probe_secs: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            workers: 8,
            max_attempts: 3,
            metrics_buffer: 1024,
            policy: BalancePolicy::Weighted,
            upstream_timeout_secs: 30,
            health_probe_secs: None,
        }
    }
}

impl DispatcherConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn health_probe_interval(&self) -> Option<Duration> {
        self.health_probe_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Optimizer endpoint receiving scheduling inputs.
    pub url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Interval between scheduling cycles per community.
    pub interval_secs: u64,
    /// How long a pass waits for newly created pods to become ready.
    pub ready_timeout_secs: u64,
    /// Delay reported between distinct nodes when no delay source is wired.
    pub default_delay_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000/schedule".to_string(),
            timeout_secs: 20,
            connect_timeout_secs: 90,
            interval_secs: 30,
            ready_timeout_secs: 60,
            default_delay_ms: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionerConfig {
    /// SLPA community partition endpoint.
    pub url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Interval between full partition recomputes.
    pub resync_secs: u64,
}

impl Default for PartitionerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4567/communities".to_string(),
            timeout_secs: 20,
            connect_timeout_secs: 90,
            resync_secs: 300,
        }
    }
}

impl PartitionerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub window_secs: u64,
    pub granularity_secs: u64,
    /// Rows per persisted batch.
    pub batch_size: usize,
    /// Fixed number of drain workers writing to the sample store.
    pub drain_workers: usize,
    /// Bounded buffer between the collector and the drain workers.
    pub buffer: usize,
    /// Directory holding the sample store. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Seconds between resource samples of local pods; 0 disables.
    pub resource_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            granularity_secs: 1,
            batch_size: 100,
            drain_workers: 2,
            buffer: 4096,
            data_dir: None,
            resource_interval_secs: 15,
        }
    }
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_secs(self.granularity_secs.max(1))
    }

    pub fn resource_interval(&self) -> Option<Duration> {
        (self.resource_interval_secs > 0).then(|| Duration::from_secs(self.resource_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Workers per reconciliation loop.
    pub threadiness: usize,
    /// Retries per key before the work queue gives up on it.
    pub max_retries: u32,
    /// Admin API listen address.
    pub api_listen: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            threadiness: 2,
            max_retries: 10,
            api_listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
        }
    }
}

impl EdgeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EdgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: EdgeConfig = toml::from_str("").unwrap();
        assert_eq!(config.node.name, "standalone");
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.dispatcher.policy, BalancePolicy::Weighted);
        assert_eq!(config.scheduler.timeout(), Duration::from_secs(20));
        assert_eq!(config.scheduler.connect_timeout(), Duration::from_secs(90));
        assert!(config.metrics.data_dir.is_none());
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[node]
name = "edge-3"

[dispatcher]
listen = "127.0.0.1:9000"
policy = "round_robin"
health_probe_secs = 5

[metrics]
window_secs = 30
"#;
        let config: EdgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.name, "edge-3");
        assert_eq!(config.node.namespace, "openfaas-fn");
        assert_eq!(config.dispatcher.listen.port(), 9000);
        assert_eq!(config.dispatcher.policy, BalancePolicy::RoundRobin);
        assert_eq!(
            config.dispatcher.health_probe_interval(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.metrics.window(), Duration::from_secs(30));
        assert_eq!(config.metrics.batch_size, 100);
    }

    #[test]
    fn granularity_never_zero() {
        let config: EdgeConfig = toml::from_str("[metrics]\ngranularity_secs = 0\n").unwrap();
        assert_eq!(config.metrics.granularity(), Duration::from_secs(1));
    }

    #[test]
    fn resource_sampling_can_be_disabled() {
        assert_eq!(
            EdgeConfig::default().metrics.resource_interval(),
            Some(Duration::from_secs(15))
        );
        let config: EdgeConfig =
            toml::from_str("[metrics]\nresource_interval_secs = 0\n").unwrap();
        assert!(config.metrics.resource_interval().is_none());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = EdgeConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let back: EdgeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.dispatcher.listen, config.dispatcher.listen);
    }
}
