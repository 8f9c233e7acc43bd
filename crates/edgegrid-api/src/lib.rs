//! edgegrid-api — read-only admin API for an EdgeGrid node.
//!
//! Serves the cluster view the control plane works from, the dispatcher's
//! current routing table, and the rolling function metrics in Prometheus
//! text format.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes` | List nodes with community and role |
//! | GET | `/api/v1/functions` | List functions in the namespace |
//! | GET | `/api/v1/pods` | List function pods in the namespace |
//! | GET | `/api/v1/schedules` | List community schedules |
//! | GET | `/api/v1/schedules/{community}` | Get one community schedule |
//! | GET | `/api/v1/configurations` | List community configurations |
//! | GET | `/api/v1/routing` | Dispatcher backends and weights |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use edgegrid_metrics::MetricsCollector;
use edgegrid_proxy::Dispatcher;
use edgegrid_state::ClusterApi;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<dyn ClusterApi>,
    pub namespace: String,
    /// Present when this node runs a dispatcher.
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub collector: Option<Arc<MetricsCollector>>,
}

impl ApiState {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            dispatcher: None,
            collector: None,
        }
    }

    pub fn with_dispatcher(
        mut self,
        dispatcher: Arc<Dispatcher>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        self.dispatcher = Some(dispatcher);
        self.collector = Some(collector);
        self
    }
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/functions", get(handlers::list_functions))
        .route("/pods", get(handlers::list_pods))
        .route("/schedules", get(handlers::list_schedules))
        .route("/schedules/{community}", get(handlers::get_schedule))
        .route("/configurations", get(handlers::list_configurations))
        .route("/routing", get(handlers::routing_table))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
