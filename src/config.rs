//! Bootstrap configuration for a Palisade node.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::mesh::ClusterConfig;
use crate::settings::LimiterSettings;

/// Main configuration for a Palisade node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalisadeConfig {
    /// Cluster/gossip configuration.
    #[serde(default)]
    pub cluster: ClusterSection,

    /// Initial limiter settings applied at startup. Nodes joining an
    /// existing cluster converge onto the highest-versioned settings
    /// gossiped by their peers.
    #[serde(default)]
    pub admission: LimiterSettings,
}

impl Default for PalisadeConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterSection::default(),
            admission: LimiterSettings::default(),
        }
    }
}

/// Cluster configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Whether to join a gossip cluster at all.
    #[serde(default)]
    pub enabled: bool,

    /// Unique node identifier; generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,

    /// The address to listen on for gossip.
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// The address to advertise to other nodes; defaults to the listen
    /// address.
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to bootstrap cluster membership.
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Cluster identifier (nodes must have matching cluster IDs).
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// How often to gossip with peers, in milliseconds.
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    "0.0.0.0:7946".parse().unwrap()
}

fn default_cluster_id() -> String {
    "palisade".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

impl ClusterSection {
    /// Assemble the mesh configuration from this section.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: std::time::Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

impl PalisadeConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::PalisadeError::Config(e.to_string()))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PalisadeConfig::default();
        assert!(!config.cluster.enabled);
        assert_eq!(config.cluster.cluster_id, "palisade");
        assert!(!config.admission.enable_ip_based_limiter);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
cluster:
  enabled: true
  listen_addr: "127.0.0.1:7001"
  seed_nodes:
    - "127.0.0.1:7000"
admission:
  enable_ip_based_limiter: true
  limit_capacity_for_ip: 20
"#;
        let config = PalisadeConfig::from_yaml(yaml).unwrap();
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.seed_nodes, vec!["127.0.0.1:7000".to_string()]);
        assert!(config.admission.enable_ip_based_limiter);
        assert_eq!(config.admission.limit_capacity_for_ip, 20);

        let cluster_config = config.cluster.to_cluster_config();
        assert_eq!(cluster_config.listen_addr, "127.0.0.1:7001".parse().unwrap());
        assert_eq!(cluster_config.advertise_addr, cluster_config.listen_addr);
        assert!(!cluster_config.node_id.is_empty());
    }
}
