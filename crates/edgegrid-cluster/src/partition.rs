//! Client for the external SLPA community partitioner.

use std::collections::BTreeMap;
use std::time::Duration;

use edgegrid_core::config::PartitionerConfig;
use edgegrid_state::{CommunityParameters, NodeView};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClusterResult;

/// A node as the partitioner sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayMatrix {
    pub routes: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub parameters: CommunityParameters,
    pub hosts: Vec<Host>,
    pub delay_matrix: DelayMatrix,
}

impl PartitionRequest {
    /// `delays` rows follow `nodes` order.
    pub fn new(parameters: CommunityParameters, nodes: &[NodeView], delays: &[Vec<i64>]) -> Self {
        Self {
            parameters,
            hosts: nodes
                .iter()
                .map(|n| Host {
                    name: n.name.clone(),
                    labels: n.labels.clone(),
                })
                .collect(),
            delay_matrix: DelayMatrix {
                routes: delays
                    .iter()
                    .map(|row| row.iter().map(|d| *d as f64).collect())
                    .collect(),
            },
        }
    }
}

/// One community returned by the partitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedCommunity {
    pub name: String,
    #[serde(default)]
    pub members: Vec<Host>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionResponse {
    #[serde(default)]
    pub communities: Vec<PartitionedCommunity>,
}

#[derive(Debug, Clone)]
pub struct PartitionClient {
    client: Client,
    url: String,
}

impl PartitionClient {
    pub fn new(config: &PartitionerConfig) -> ClusterResult<Self> {
        Self::with_timeouts(&config.url, config.timeout(), config.connect_timeout())
    }

    pub fn with_timeouts(
        url: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> ClusterResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Ask the partitioner to group `request.hosts` into communities.
    pub async fn communities(
        &self,
        request: &PartitionRequest,
    ) -> ClusterResult<Vec<PartitionedCommunity>> {
        debug!(url = %self.url, hosts = request.hosts.len(), "requesting partition");
        let response: PartitionResponse = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.communities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    fn node(name: &str) -> NodeView {
        NodeView {
            name: name.into(),
            address: "10.0.0.1".into(),
            capacity_memory_bytes: 1,
            capacity_cpu_millis: 1,
            gpu_memory_bytes: None,
            community: None,
            role: None,
            ready: true,
            master: false,
            labels: [("zone".to_string(), "eu".to_string())].into(),
            resource_version: 0,
        }
    }

    #[test]
    fn request_matches_the_wire_shape() {
        let req = PartitionRequest::new(
            CommunityParameters::default(),
            &[node("a"), node("b")],
            &[vec![0, 4], vec![4, 0]],
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["parameters"]["community_size"], 10);
        assert_eq!(json["hosts"][1]["name"], "b");
        assert_eq!(json["hosts"][0]["labels"]["zone"], "eu");
        assert_eq!(json["delay_matrix"]["routes"][0][1], 4.0);
    }

    #[tokio::test]
    async fn communities_are_decoded() {
        let router = Router::new().route(
            "/communities",
            post(|Json(req): Json<PartitionRequest>| async move {
                Json(serde_json::json!({
                    "communities": [{
                        "name": "c-0",
                        "members": req.hosts.iter().map(|h| serde_json::json!({"name": h.name})).collect::<Vec<_>>(),
                    }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let client = PartitionClient::with_timeouts(
            format!("http://{addr}/communities"),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();
        let req = PartitionRequest::new(CommunityParameters::default(), &[node("a")], &[vec![0]]);
        let communities = client.communities(&req).await.unwrap();
        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0].members[0].name, "a");
        assert!(communities[0].members[0].labels.is_empty());
    }
}
