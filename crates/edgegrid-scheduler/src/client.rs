//! HTTP client for the external scheduling optimizer.

use edgegrid_core::config::SchedulerConfig;
use edgegrid_state::{Allocation, CommunitySchedule, FunctionSpec, NodeView, RoutingRules};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Request body sent to the optimizer. Arrays are parallel: index `i` of
/// `node_names` matches row `i` of both matrices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingInput {
    pub node_names: Vec<String>,
    pub function_names: Vec<String>,
    pub node_memories: Vec<i64>,
    pub function_memories: Vec<i64>,
    /// `nodes × nodes`, milliseconds.
    pub delay_matrix: Vec<Vec<i64>>,
    pub max_delays: Vec<i64>,
    /// `nodes × functions`, requests observed per source node.
    pub workload_matrix: Vec<Vec<i64>>,
}

impl SchedulingInput {
    /// Validate dimensions and build the payload.
    pub fn new(
        nodes: &[NodeView],
        functions: &[FunctionSpec],
        delays: Vec<Vec<i64>>,
        workloads: Vec<Vec<i64>>,
        max_delays: Vec<i64>,
    ) -> SchedulerResult<Self> {
        let (n, f) = (nodes.len(), functions.len());
        if n == 0 {
            return Err(SchedulerError::InvalidDimension("no nodes".into()));
        }
        if f == 0 {
            return Err(SchedulerError::InvalidDimension("no functions".into()));
        }
        if delays.len() != n || delays.iter().any(|row| row.len() != n) {
            return Err(SchedulerError::InvalidDimension(format!(
                "delay matrix must be {n}x{n}"
            )));
        }
        if workloads.len() != n || workloads.iter().any(|row| row.len() != f) {
            return Err(SchedulerError::InvalidDimension(format!(
                "workload matrix must be {n}x{f}"
            )));
        }
        if max_delays.len() != f {
            return Err(SchedulerError::InvalidDimension(format!(
                "expected {f} max delays, got {}",
                max_delays.len()
            )));
        }

        Ok(Self {
            node_names: nodes.iter().map(|n| n.name.clone()).collect(),
            function_names: functions.iter().map(|f| f.key.to_string()).collect(),
            node_memories: nodes
                .iter()
                .map(|n| saturating_i64(n.capacity_memory_bytes))
                .collect(),
            function_memories: functions
                .iter()
                .map(|f| saturating_i64(f.requests.memory_bytes))
                .collect(),
            delay_matrix: delays,
            max_delays,
            workload_matrix: workloads,
        })
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Optimizer response: desired placement and traffic split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingOutput {
    pub node_names: Vec<String>,
    pub function_names: Vec<String>,
    pub cpu_routing_rules: RoutingRules,
    pub cpu_allocations: Allocation,
    pub gpu_routing_rules: RoutingRules,
    pub gpu_allocations: Allocation,
}

impl SchedulingOutput {
    /// Overwrite the schedule's allocations and rules. Never merges.
    pub fn apply_to(&self, schedule: &mut CommunitySchedule) {
        schedule.cpu_allocations = self.cpu_allocations.clone();
        schedule.gpu_allocations = self.gpu_allocations.clone();
        schedule.cpu_routing_rules = self.cpu_routing_rules.clone();
        schedule.gpu_routing_rules = self.gpu_routing_rules.clone();
    }
}

/// Blocking-per-call JSON client. No retries; the work queue retries.
#[derive(Debug, Clone)]
pub struct SchedulingClient {
    client: Client,
    url: String,
}

impl SchedulingClient {
    pub fn new(config: &SchedulerConfig) -> SchedulerResult<Self> {
        Self::with_timeouts(&config.url, config.timeout(), config.connect_timeout())
    }

    pub fn with_timeouts(
        url: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> SchedulerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the input and decode the optimizer's answer.
    pub async fn schedule(&self, input: &SchedulingInput) -> SchedulerResult<SchedulingOutput> {
        debug!(
            url = %self.url,
            nodes = input.node_names.len(),
            functions = input.function_names.len(),
            "requesting schedule"
        );
        let output = self
            .client
            .post(&self.url)
            .json(input)
            .send()
            .await?
            .error_for_status()?
            .json::<SchedulingOutput>()
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use edgegrid_core::FunctionKey;
    use edgegrid_state::Resources;
    use std::collections::BTreeMap;

    fn nodes(n: usize) -> Vec<NodeView> {
        (0..n)
            .map(|i| NodeView {
                name: format!("node-{i}"),
                address: format!("10.0.0.{i}"),
                capacity_memory_bytes: 1024,
                capacity_cpu_millis: 1000,
                gpu_memory_bytes: None,
                community: Some("c-0".into()),
                role: None,
                ready: true,
                master: false,
                labels: BTreeMap::new(),
                resource_version: 0,
            })
            .collect()
    }

    fn functions(f: usize) -> Vec<FunctionSpec> {
        (0..f)
            .map(|i| FunctionSpec {
                key: FunctionKey::new("ns", format!("fn-{i}")),
                image: "img".into(),
                env: BTreeMap::new(),
                port: 8080,
                requests: Resources {
                    memory_bytes: 64,
                    ..Resources::default()
                },
                limits: Resources::default(),
                gpu: false,
                max_delay_ms: 100,
            })
            .collect()
    }

    #[test]
    fn well_formed_input_builds_parallel_arrays() {
        let input = SchedulingInput::new(
            &nodes(2),
            &functions(3),
            vec![vec![0, 5], vec![5, 0]],
            vec![vec![1, 2, 3], vec![4, 5, 6]],
            vec![100, 100, 100],
        )
        .unwrap();
        assert_eq!(input.node_names, vec!["node-0", "node-1"]);
        assert_eq!(input.node_memories, vec![1024, 1024]);
        assert_eq!(input.function_names, vec!["ns/fn-0", "ns/fn-1", "ns/fn-2"]);
        assert_eq!(input.function_memories, vec![64, 64, 64]);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let ok_delays = || vec![vec![0, 5], vec![5, 0]];
        let ok_work = || vec![vec![1], vec![1]];
        let cases: Vec<SchedulerResult<SchedulingInput>> = vec![
            SchedulingInput::new(&nodes(0), &functions(1), vec![], vec![], vec![1]),
            SchedulingInput::new(&nodes(2), &functions(0), ok_delays(), vec![vec![], vec![]], vec![]),
            SchedulingInput::new(&nodes(2), &functions(1), vec![vec![0, 5]], ok_work(), vec![1]),
            SchedulingInput::new(&nodes(2), &functions(1), vec![vec![0], vec![0]], ok_work(), vec![1]),
            SchedulingInput::new(&nodes(2), &functions(1), ok_delays(), vec![vec![1]], vec![1]),
            SchedulingInput::new(&nodes(2), &functions(1), ok_delays(), vec![vec![1, 2], vec![1]], vec![1]),
            SchedulingInput::new(&nodes(2), &functions(1), ok_delays(), ok_work(), vec![1, 2]),
        ];
        for case in cases {
            assert!(matches!(case, Err(SchedulerError::InvalidDimension(_))));
        }
    }

    #[test]
    fn apply_replaces_wholesale() {
        let mut schedule = CommunitySchedule::empty("ns", "c-0");
        schedule
            .cpu_allocations
            .entry(FunctionKey::new("ns", "old"))
            .or_default()
            .insert("node-0".into(), true);

        let mut output = SchedulingOutput::default();
        output
            .gpu_allocations
            .entry(FunctionKey::new("ns", "new"))
            .or_default()
            .insert("node-1".into(), true);
        output.apply_to(&mut schedule);

        assert!(schedule.cpu_allocations.is_empty());
        assert_eq!(schedule.gpu_allocations.len(), 1);
    }

    #[test]
    fn output_decodes_optimizer_json() {
        let json = r#"{
            "node_names": ["node-1"],
            "function_names": ["ns/fn"],
            "cpu_allocations": {"ns/fn": {"node-1": true}},
            "cpu_routing_rules": {"node-1": {"node-1": {"ns/fn": 1.0}}}
        }"#;
        let output: SchedulingOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.cpu_allocations[&FunctionKey::new("ns", "fn")]["node-1"], true);
        assert!(output.gpu_allocations.is_empty());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/schedule")
    }

    #[tokio::test]
    async fn schedule_posts_input_and_decodes_answer() {
        let router = Router::new().route(
            "/schedule",
            post(|Json(input): Json<SchedulingInput>| async move {
                let mut output = SchedulingOutput {
                    node_names: input.node_names.clone(),
                    function_names: input.function_names.clone(),
                    ..SchedulingOutput::default()
                };
                for name in &input.function_names {
                    let key: FunctionKey = name.parse().unwrap();
                    output
                        .cpu_allocations
                        .entry(key)
                        .or_default()
                        .insert(input.node_names[0].clone(), true);
                }
                Json(output)
            }),
        );
        let url = serve(router).await;
        let client =
            SchedulingClient::with_timeouts(url, Duration::from_secs(5), Duration::from_secs(5))
                .unwrap();

        let input = SchedulingInput::new(
            &nodes(1),
            &functions(1),
            vec![vec![0]],
            vec![vec![0]],
            vec![100],
        )
        .unwrap();
        let output = client.schedule(&input).await.unwrap();
        assert_eq!(output.node_names, vec!["node-0"]);
        assert_eq!(output.cpu_allocations.len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_returned() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/schedule", listener.local_addr().unwrap());
        drop(listener);
        let client =
            SchedulingClient::with_timeouts(url, Duration::from_secs(2), Duration::from_secs(2))
                .unwrap();
        let input =
            SchedulingInput::new(&nodes(1), &functions(1), vec![vec![0]], vec![vec![0]], vec![1])
                .unwrap();
        assert!(matches!(
            client.schedule(&input).await,
            Err(SchedulerError::Transport(_))
        ));
    }
}
