//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for distributed admission control.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to join cluster: {0}")]
    JoinError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr: SocketAddr = "0.0.0.0:7946".parse().unwrap();
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "palisade".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Key identifying a usage counter in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// The limiter resource the counter belongs to.
    pub resource: String,
    /// The usage key (limit name plus caller key).
    pub key: String,
    /// The window start (epoch milliseconds, floored to the boundary).
    pub window: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(resource: &str, key: &str, window: u64) -> Self {
        Self {
            resource: resource.to_string(),
            key: key.to_string(),
            window,
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "counter|{resource}|{key}|{window}"
    pub fn to_state_key(&self) -> String {
        format!("counter|{}|{}|{}", self.resource, self.key, self.window)
    }

    /// Parse from a chitchat key string.
    pub fn from_state_key(state_key: &str) -> Option<Self> {
        let rest = state_key.strip_prefix("counter|")?;

        // Split from the right so keys containing the delimiter survive.
        let last_sep = rest.rfind('|')?;
        let window: u64 = rest[last_sep + 1..].parse().ok()?;

        let before_window = &rest[..last_sep];
        let first_sep = before_window.find('|')?;

        Some(Self {
            resource: before_window[..first_sep].to_string(),
            key: before_window[first_sep + 1..].to_string(),
            window,
        })
    }
}

/// Gossip state key carrying the serialized limiter settings message.
const SETTINGS_STATE_KEY: &str = "admission_settings";

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    /// Configuration, kept so callers can derive poll intervals.
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The configuration this node was started with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Increment a counter and return the total across all nodes.
    ///
    /// This sets our local contribution for the counter key and reads
    /// all other nodes' contributions to compute the total.
    pub async fn increment_counter(&self, key: &CounterKey, amount: u64) -> u64 {
        let state_key = key.to_state_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&state_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat
            .self_node_state()
            .set(&state_key, new_local.to_string());

        debug!(
            key = %state_key,
            local_value = new_local,
            "Incremented local counter"
        );

        self.sum_counter_internal(&chitchat, &state_key)
    }

    /// Get the total count for a key across all nodes.
    pub async fn get_count(&self, key: &CounterKey) -> u64 {
        let state_key = key.to_state_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        self.sum_counter_internal(&chitchat, &state_key)
    }

    /// Internal helper to sum a counter across all nodes.
    fn sum_counter_internal(&self, chitchat: &chitchat::Chitchat, key: &str) -> u64 {
        let mut total: u64 = 0;

        for node_id in chitchat.live_nodes() {
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(value) = node_state.get(key) {
                    if let Ok(count) = value.parse::<u64>() {
                        total += count;
                    }
                }
            }
        }

        total
    }

    /// Publish this node's serialized limiter settings into the gossip
    /// state so peers can pick them up.
    pub async fn publish_settings(&self, message: &str) {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat
            .self_node_state()
            .set(SETTINGS_STATE_KEY, message);
        debug!("Published settings message to cluster state");
    }

    /// The highest-versioned settings message published by a peer, if
    /// any. Our own state is skipped so a node never re-applies its own
    /// broadcast.
    pub async fn latest_peer_settings(&self) -> Option<(u64, String)> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        let mut best: Option<(u64, String)> = None;

        for node_id in chitchat.live_nodes() {
            if node_id.node_id == self.node_id {
                continue;
            }
            let Some(node_state) = chitchat.node_state(node_id) else {
                continue;
            };
            let Some(message) = node_state.get(SETTINGS_STATE_KEY) else {
                continue;
            };
            let Some(version) = crate::settings::wire::peek_version(message) else {
                continue;
            };
            if best.as_ref().map_or(true, |(v, _)| version > *v) {
                best = Some((version, message.to_string()));
            }
        }

        best
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::StartError(format!("Shutdown error: {:?}", e)))?;
        Ok(())
    }
}
