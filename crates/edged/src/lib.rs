//! Wiring for the `edged` daemon.
//!
//! The binary picks a mode and calls into these modules; integration tests
//! drive the same entry points against fake optimizer and partitioner
//! services.
//!
//! ```text
//! edged standalone   control plane + dispatcher + admin API
//! edged controller   control plane + admin API
//! edged dispatcher   dispatcher + admin API
//! ```

pub mod control_plane;
pub mod dispatcher_node;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use edgegrid_api::ApiState;
use edgegrid_core::config::{MetricsConfig, SchedulerConfig};
use edgegrid_state::{ClusterManifest, ConstantDelay, DelaySource, MemoryCluster, StateStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub use control_plane::{ControlPlane, spawn_control_plane};
pub use dispatcher_node::{DispatcherNode, spawn_dispatcher};

const STORE_FILE: &str = "edgegrid.redb";

/// In-process cluster seeded from a manifest. Bound pods turn ready at once.
pub fn load_cluster(manifest: Option<&Path>) -> anyhow::Result<Arc<MemoryCluster>> {
    let manifest = match manifest {
        Some(path) => ClusterManifest::from_file(path)
            .with_context(|| format!("failed to load cluster manifest {}", path.display()))?,
        None => ClusterManifest::default(),
    };
    info!(
        nodes = manifest.nodes.len(),
        functions = manifest.functions.len(),
        configurations = manifest.configurations.len(),
        "cluster manifest loaded"
    );
    Ok(Arc::new(MemoryCluster::from_manifest(manifest, true)))
}

/// Sample store under `data_dir`, or in memory when none is configured.
pub fn open_store(config: &MetricsConfig) -> anyhow::Result<StateStore> {
    let store = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let path = dir.join(STORE_FILE);
            let store = StateStore::open(&path)?;
            info!(path = ?path, "sample store opened");
            store
        }
        None => {
            info!("sample store kept in memory");
            StateStore::open_in_memory()?
        }
    };
    Ok(store)
}

/// Node-to-node delays. A constant until a measured source is wired in.
pub fn delay_source(config: &SchedulerConfig) -> Arc<dyn DelaySource> {
    Arc::new(ConstantDelay(config.default_delay_ms))
}

/// Serve the admin API until shutdown.
pub async fn serve_api(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "admin API listening");
    axum::serve(listener, edgegrid_api::build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    info!("admin API stopped");
    Ok(())
}
