use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};

use palisade::config::PalisadeConfig;
use palisade::mesh::{spawn_settings_watcher, Cluster, ClusterSettingsPublisher};
use palisade::settings::{LimiterSettings, SettingsStore};

/// Palisade admission node: joins the gossip mesh and keeps limiter
/// settings and usage counters synchronized with its peers.
#[derive(Debug, Parser)]
#[command(name = "palisade", version, about)]
struct Args {
    /// Path to the YAML bootstrap configuration.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the gossip listen address.
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Seed node addresses; passing any implies cluster mode.
    #[arg(long = "seed")]
    seeds: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Palisade admission node");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PalisadeConfig::from_file(path)?,
        None => PalisadeConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.cluster.listen_addr = listen;
    }
    if !args.seeds.is_empty() {
        config.cluster.enabled = true;
        config.cluster.seed_nodes.extend(args.seeds.iter().cloned());
    }

    let initial: LimiterSettings = config.admission.clone();
    let store = Arc::new(SettingsStore::new(initial));
    info!(version = store.version(), "Limiter settings loaded");

    let mut cluster_handle = None;
    let mut watcher = None;
    if config.cluster.enabled {
        let cluster_config = config.cluster.to_cluster_config();
        let poll_interval = cluster_config.gossip_interval;
        let cluster = Arc::new(Cluster::start(cluster_config).await?);

        store.add_listener(Arc::new(ClusterSettingsPublisher::new(Arc::clone(
            &cluster,
        ))));
        cluster.publish_settings(&store.to_message(false)).await;
        watcher = Some(spawn_settings_watcher(
            Arc::clone(&cluster),
            Arc::clone(&store),
            poll_interval,
        ));

        info!(node_id = %cluster.node_id(), "Joined gossip cluster");
        cluster_handle = Some(cluster);
    } else {
        warn!("Cluster disabled; running standalone");
    }

    shutdown_signal().await;

    if let Some(watcher) = watcher {
        watcher.abort();
        let _ = watcher.await;
    }
    // The publisher registered on the store holds the last other cluster
    // handle; release it so the node can leave the mesh cleanly.
    drop(store);
    if let Some(cluster) = cluster_handle {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster handle still shared, skipping graceful leave"),
        }
    }

    info!("Palisade admission node stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
