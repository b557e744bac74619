//! Cluster-backed usage ledger.
//!
//! Each node contributes its local count for a `(resource, key, window)`
//! triple into the gossip state; the current usage is the sum of live
//! nodes' contributions. Convergence is eventual, so short bursts can
//! overshoot a quota across nodes until gossip catches up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::Result;
use crate::mesh::{Cluster, CounterKey};

use super::storage::UsageStorage;

/// Usage storage distributed over a gossip cluster.
pub struct ClusterStorage {
    cluster: Arc<Cluster>,
}

impl ClusterStorage {
    /// Create a storage backed by the given cluster.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// The underlying cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

#[async_trait]
impl UsageStorage for ClusterStorage {
    async fn add_and_get(
        &self,
        resource: &str,
        key: &str,
        window: Duration,
        now_millis: u64,
        _limit: u64,
    ) -> Result<u64> {
        let window_millis = (window.as_millis() as u64).max(1);
        // Floor to the window boundary so every node accounts the same
        // window under the same gossip key.
        let window_start = now_millis / window_millis * window_millis;
        let counter_key = CounterKey::new(resource, key, window_start);
        let count = self.cluster.increment_counter(&counter_key, 1).await;
        trace!(
            resource,
            key,
            window_start,
            count,
            "incremented distributed counter"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;

    #[tokio::test]
    async fn test_cluster_storage_counts_per_window() {
        let addr = ([127, 0, 0, 1], 19464).into();
        let config = ClusterConfig {
            node_id: "storage-test".to_string(),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        };
        let cluster = Arc::new(Cluster::start(config).await.unwrap());

        {
            let storage = ClusterStorage::new(Arc::clone(&cluster));
            let window = Duration::from_secs(60);
            for expected in 1..=3u64 {
                let count = storage
                    .add_and_get("request:ip", "ip:10.0.0.1", window, 120_000, 10)
                    .await
                    .unwrap();
                assert_eq!(count, expected);
            }
            // The next window accounts under a fresh gossip key.
            let count = storage
                .add_and_get("request:ip", "ip:10.0.0.1", window, 180_000, 10)
                .await
                .unwrap();
            assert_eq!(count, 1);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
