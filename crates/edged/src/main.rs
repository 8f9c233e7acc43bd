//! edged — the EdgeGrid node daemon.
//!
//! # Usage
//!
//! ```text
//! edged --config /etc/edgegrid/edged.toml standalone --manifest cluster.toml
//! edged controller --manifest cluster.toml
//! edged dispatcher --node edge-3
//! edged config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use edgegrid_api::ApiState;
use edgegrid_core::EdgeConfig;
use edgegrid_state::ClusterApi;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "edged", about = "EdgeGrid node daemon")]
struct Cli {
    /// Path to edged.toml. Built-in defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Control plane, dispatcher and admin API in one process.
    Standalone {
        /// Cluster manifest (nodes, functions, community configurations).
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Overrides `node.name`.
        #[arg(long)]
        node: Option<String>,
    },
    /// Community controllers and admin API only.
    Controller {
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Dispatcher and admin API only.
    Dispatcher {
        #[arg(long)]
        manifest: Option<PathBuf>,

        #[arg(long)]
        node: Option<String>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("info,edged=debug,edgegrid=debug")
                }),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EdgeConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EdgeConfig::default(),
    };

    match cli.command {
        Command::Standalone { manifest, node } => {
            if let Some(node) = node {
                config.node.name = node;
            }
            run(config, manifest, true, true).await
        }
        Command::Controller { manifest } => run(config, manifest, true, false).await,
        Command::Dispatcher { manifest, node } => {
            if let Some(node) = node {
                config.node.name = node;
            }
            run(config, manifest, false, true).await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(
    config: EdgeConfig,
    manifest: Option<PathBuf>,
    control_plane: bool,
    dispatcher: bool,
) -> anyhow::Result<()> {
    info!(
        node = %config.node.name,
        namespace = %config.node.namespace,
        control_plane,
        dispatcher,
        "edged starting"
    );

    let cluster: Arc<dyn ClusterApi> = edged::load_cluster(manifest.as_deref())?;
    let store = edged::open_store(&config.metrics)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Subsystems ─────────────────────────────────────────────

    let plane = if control_plane {
        Some(edged::spawn_control_plane(
            cluster.clone(),
            &config,
            store.clone(),
            shutdown_rx.clone(),
        )?)
    } else {
        None
    };

    let node = if dispatcher {
        let listener = TcpListener::bind(config.dispatcher.listen)
            .await
            .with_context(|| format!("failed to bind dispatcher on {}", config.dispatcher.listen))?;
        Some(edged::spawn_dispatcher(
            cluster.clone(),
            &config,
            store,
            listener,
            shutdown_rx.clone(),
        )?)
    } else {
        None
    };

    // ── Admin API ──────────────────────────────────────────────

    let mut api_state = ApiState::new(cluster, &config.node.namespace);
    if let Some(node) = &node {
        api_state = api_state.with_dispatcher(node.dispatcher.clone(), node.collector.clone());
    }
    let api_listener = TcpListener::bind(config.controller.api_listen)
        .await
        .with_context(|| format!("failed to bind admin API on {}", config.controller.api_listen))?;
    let api = tokio::spawn(edged::serve_api(api_listener, api_state, shutdown_rx));

    // ── Shutdown ───────────────────────────────────────────────

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match api.await {
        Ok(Err(e)) => warn!(error = %e, "admin API failed"),
        Err(e) => warn!(error = %e, "admin API panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(plane) = plane {
        plane.join().await;
    }
    if let Some(node) = node {
        node.join().await;
    }

    info!("edged stopped");
    Ok(())
}

/// First Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
