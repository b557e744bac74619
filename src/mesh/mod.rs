//! Peer mesh networking for distributed state.
//!
//! Nodes gossip two kinds of state: per-window usage counters (summed
//! across live nodes by [`crate::ratelimit::ClusterStorage`]) and the
//! serialized limiter settings message, so a change made on one node
//! reaches every other node without centralized storage.

mod cluster;
mod sync;

pub use cluster::{Cluster, ClusterConfig, ClusterError, CounterKey};
pub use sync::{spawn_settings_watcher, ClusterSettingsPublisher};
