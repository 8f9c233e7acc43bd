//! REST API handlers.
//!
//! Every handler reads through `ClusterApi` or the local dispatcher and
//! returns the `{success, data, error}` JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use edgegrid_state::{NodeSelector, PodSelector};
use serde::Serialize;
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    warn!(error = %e, "admin api read failed");
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

// ── Cluster view ───────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.list_nodes(&NodeSelector::all()).await {
        Ok(mut nodes) => {
            nodes.sort_by(|a, b| a.name.cmp(&b.name));
            ApiResponse::ok(nodes).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/functions
pub async fn list_functions(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.list_functions(&state.namespace).await {
        Ok(mut functions) => {
            functions.sort_by(|a, b| a.key.cmp(&b.key));
            ApiResponse::ok(functions).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/pods
pub async fn list_pods(State(state): State<ApiState>) -> impl IntoResponse {
    match state
        .cluster
        .list_pods(&PodSelector::namespace(&state.namespace))
        .await
    {
        Ok(mut pods) => {
            pods.sort_by(|a, b| a.name.cmp(&b.name));
            ApiResponse::ok(pods).into_response()
        }
        Err(e) => internal(e),
    }
}

// ── Schedules ──────────────────────────────────────────────────

/// GET /api/v1/schedules
pub async fn list_schedules(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.list_schedules(&state.namespace).await {
        Ok(mut schedules) => {
            schedules.sort_by(|a, b| a.community.cmp(&b.community));
            ApiResponse::ok(schedules).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/schedules/:community
pub async fn get_schedule(
    State(state): State<ApiState>,
    Path(community): Path<String>,
) -> impl IntoResponse {
    match state.cluster.get_schedule(&state.namespace, &community).await {
        Ok(schedule) => ApiResponse::ok(schedule).into_response(),
        Err(e) if e.is_not_found() => {
            error_response("schedule not found", StatusCode::NOT_FOUND)
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/configurations
pub async fn list_configurations(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.list_configurations().await {
        Ok(configs) => ApiResponse::ok(configs).into_response(),
        Err(e) => internal(e),
    }
}

// ── Routing ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RoutedBackend {
    pub url: String,
    pub node: String,
    pub gpu: bool,
    pub weight: f64,
}

#[derive(Debug, Serialize)]
pub struct RoutedFunction {
    pub function: String,
    pub backends: Vec<RoutedBackend>,
}

/// GET /api/v1/routing
pub async fn routing_table(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(dispatcher) = state.dispatcher else {
        return error_response("no dispatcher on this node", StatusCode::NOT_FOUND);
    };
    let mut table: Vec<RoutedFunction> = dispatcher
        .balancers()
        .iter()
        .map(|lb| {
            let pool = lb.pool();
            let backends = pool
                .backends()
                .iter()
                .map(|b| RoutedBackend {
                    url: b.url.clone(),
                    node: b.node.clone(),
                    gpu: b.gpu,
                    weight: pool.weight(&b.url).unwrap_or(0.0),
                })
                .collect();
            RoutedFunction {
                function: lb.function().to_string(),
                backends,
            }
        })
        .collect();
    table.sort_by(|a, b| a.function.cmp(&b.function));
    ApiResponse::ok(table).into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshots = state
        .collector
        .as_ref()
        .map(|c| c.snapshot())
        .unwrap_or_default();
    let dropped = state
        .dispatcher
        .as_ref()
        .map(|d| d.dropped_samples())
        .unwrap_or(0);

    let body = edgegrid_metrics::render_prometheus(&snapshots, dropped);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use edgegrid_core::FunctionKey;
    use edgegrid_core::config::DispatcherConfig;
    use edgegrid_metrics::{MetricsCollector, ResponseSample};
    use edgegrid_proxy::Dispatcher;
    use edgegrid_state::{
        ClusterApi, CommunitySchedule, FunctionSpec, MemoryCluster, NodeView, PodPhase, PodView,
        Resources, Role, RoutingRules,
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const NS: &str = "ns";

    fn node(name: &str, community: Option<&str>) -> NodeView {
        NodeView {
            name: name.into(),
            address: "127.0.0.1".into(),
            capacity_memory_bytes: 1 << 30,
            capacity_cpu_millis: 2000,
            gpu_memory_bytes: None,
            community: community.map(str::to_string),
            role: community.map(|_| Role::Member),
            ready: true,
            master: false,
            labels: Default::default(),
            resource_version: 0,
        }
    }

    fn function(name: &str) -> FunctionSpec {
        FunctionSpec {
            key: FunctionKey::new(NS, name),
            image: format!("{name}:1"),
            env: Default::default(),
            port: 8080,
            requests: Resources::default(),
            limits: Resources::default(),
            gpu: false,
            max_delay_ms: 100,
        }
    }

    fn pod(name: &str, function: &str) -> PodView {
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
            port: 9000,
            image: String::new(),
            env: Default::default(),
            requests: Resources::default(),
            limits: Resources::default(),
            labels: Default::default(),
            resource_version: 0,
        }
    }

    async fn cluster() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::new(true));
        cluster.insert_node(node("node-b", Some("c-0")));
        cluster.insert_node(node("node-a", Some("c-0")));
        cluster.insert_function(function("echo"));
        cluster.create_pod(&pod("echo-1", "echo")).await.unwrap();
        cluster.bind_pod(NS, "echo-1", "node-b").await.unwrap();

        let mut schedule = CommunitySchedule::empty(NS, "c-0");
        let mut rules = RoutingRules::new();
        rules
            .entry("node-a".to_string())
            .or_default()
            .entry("node-b".to_string())
            .or_default()
            .insert(FunctionKey::new(NS, "echo"), 1.0);
        schedule.cpu_routing_rules = rules;
        cluster.create_schedule(&schedule).await.unwrap();
        cluster
    }

    async fn get(state: ApiState, uri: &str) -> (StatusCode, String, Option<String>) {
        let resp = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_string());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
    }

    fn json(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn nodes_are_listed_by_name() {
        let state = ApiState::new(cluster().await, NS);
        let (status, body, _) = get(state, "/api/v1/nodes").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][0]["name"], "node-a");
        assert_eq!(body["data"][1]["community"], "c-0");
        assert_eq!(body["data"][1]["role"], "member");
    }

    #[tokio::test]
    async fn functions_and_pods_are_listed() {
        let state = ApiState::new(cluster().await, NS);
        let (_, body, _) = get(state.clone(), "/api/v1/functions").await;
        assert_eq!(json(&body)["data"][0]["key"], "ns/echo");

        let (_, body, _) = get(state, "/api/v1/pods").await;
        assert_eq!(json(&body)["data"][0]["node"], "node-b");
    }

    #[tokio::test]
    async fn schedule_lookup() {
        let state = ApiState::new(cluster().await, NS);
        let (status, body, _) = get(state.clone(), "/api/v1/schedules/c-0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body)["data"]["cpu_routing_rules"]["node-a"]["node-b"]["ns/echo"],
            1.0
        );

        let (status, body, _) = get(state.clone(), "/api/v1/schedules/c-9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["success"], false);

        let (_, body, _) = get(state, "/api/v1/schedules").await;
        assert_eq!(json(&body)["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn routing_requires_a_dispatcher() {
        let state = ApiState::new(cluster().await, NS);
        let (status, _, _) = get(state, "/api/v1/routing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn routing_lists_synced_backends() {
        let cluster = cluster().await;
        let dispatcher = Arc::new(Dispatcher::new(
            "node-a",
            NS,
            &DispatcherConfig::default(),
            cluster.clone(),
        ));
        dispatcher.sync_routing().await.unwrap();
        let collector = Arc::new(MetricsCollector::new(
            "node-a",
            Duration::from_secs(60),
            Duration::from_secs(1),
            None,
        ));
        let state = ApiState::new(cluster, NS).with_dispatcher(dispatcher, collector);

        let (status, body, _) = get(state, "/api/v1/routing").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["data"][0]["function"], "ns/echo");
        assert_eq!(body["data"][0]["backends"][0]["url"], "http://127.0.0.1:9000");
        assert_eq!(body["data"][0]["backends"][0]["weight"], 1.0);
    }

    #[tokio::test]
    async fn metrics_are_prometheus_text() {
        let cluster = cluster().await;
        let dispatcher = Arc::new(Dispatcher::new(
            "node-a",
            NS,
            &DispatcherConfig::default(),
            cluster.clone(),
        ));
        let collector = Arc::new(MetricsCollector::new(
            "node-a",
            Duration::from_secs(60),
            Duration::from_secs(1),
            None,
        ));
        collector.record(&ResponseSample {
            timestamp_ms: 0,
            function: FunctionKey::new(NS, "echo"),
            backend_url: "http://127.0.0.1:9000".into(),
            destination: "node-b".into(),
            community: "c-0".into(),
            gpu: false,
            latency: Duration::from_millis(8),
            status: 200,
            description: String::new(),
        });
        let state = ApiState::new(cluster, NS).with_dispatcher(dispatcher, collector);

        let (status, body, content_type) = get(state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().contains("text/plain"));
        assert!(body.contains("edgegrid_function_requests{namespace=\"ns\",function=\"echo\"} 1"));
    }
}
