//! Glue between the settings store and the gossip mesh.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::settings::{wire, SettingsListener, SettingsStore};

use super::cluster::Cluster;

/// Publishes debounced settings changes into the cluster gossip state.
///
/// Register one on the [`SettingsStore`] of every cluster node.
pub struct ClusterSettingsPublisher {
    cluster: Arc<Cluster>,
}

impl ClusterSettingsPublisher {
    /// Create a publisher for the given cluster.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }
}

impl SettingsListener for ClusterSettingsPublisher {
    fn settings_changed(&self, message: &str) {
        let cluster = Arc::clone(&self.cluster);
        let message = message.to_string();
        tokio::spawn(async move {
            cluster.publish_settings(&message).await;
        });
    }
}

/// Spawn a task that applies newer-versioned peer settings onto the
/// local store.
///
/// A force-sentinel message always wins; any other message applies only
/// when its version is ahead of ours. The last applied raw message is
/// remembered so a peer stuck broadcasting a force message is applied
/// once, not on every poll.
pub fn spawn_settings_watcher(
    cluster: Arc<Cluster>,
    store: Arc<SettingsStore>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_applied: Option<String> = None;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some((version, message)) = cluster.latest_peer_settings().await else {
                continue;
            };
            if last_applied.as_deref() == Some(message.as_str()) {
                continue;
            }
            let ahead = version == wire::FORCE_VERSION || version > store.version();
            if !ahead {
                continue;
            }
            match store.apply_message(&message) {
                Ok(()) => {
                    info!(version, "applied settings from peer");
                    last_applied = Some(message);
                }
                Err(e) => {
                    warn!(error = %e, "rejected malformed peer settings message");
                    // Remember it anyway so a bad message is not re-parsed
                    // on every poll.
                    last_applied = Some(message);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::LimiterSettings;

    #[tokio::test]
    async fn test_publisher_writes_into_gossip_state() {
        let config = crate::mesh::ClusterConfig {
            node_id: "pub-test".to_string(),
            listen_addr: ([127, 0, 0, 1], 19471).into(),
            advertise_addr: ([127, 0, 0, 1], 19471).into(),
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        };
        let cluster = Arc::new(Cluster::start(config).await.unwrap());

        let store = Arc::new(SettingsStore::new(LimiterSettings::default()));
        let publisher = ClusterSettingsPublisher::new(Arc::clone(&cluster));
        let message = store.to_message(false);
        publisher.settings_changed(&message);

        // Let the spawned publish task run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let chitchat_arc = cluster.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let published = chitchat
            .self_node_state()
            .get("admission_settings")
            .map(str::to_string);
        assert_eq!(published.as_deref(), Some(message.as_str()));
        drop(chitchat);

        drop(publisher);
        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
