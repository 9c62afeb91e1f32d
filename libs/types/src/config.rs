// SPDX-License-Identifier: MPL-2.0

//! Configuration model consumed from the external loader.
//!
//! The daemon front-end owns file parsing; the core only defines the shapes
//! and their defaults, so any serde-capable loader can produce them.

use serde::{Deserialize, Serialize};

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7700
}

fn default_data_dir() -> String {
    "/var/lib/xsan".to_string()
}

/// Identity and endpoints of the local node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct NodeConfig {
    /// UUID string of this node.
    pub node_id: String,
    pub node_name: String,
    pub bind_ip: String,
    pub port: u16,
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_name: String::new(),
            bind_ip: default_bind_ip(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Cluster-wide settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_name: String,
    /// Comma-separated `<uuid>@<ip>:<port>` entries.
    pub seed_nodes: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub quorum_nodes: u32,
    pub network_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "xsan".to_string(),
            seed_nodes: String::new(),
            min_nodes: 1,
            max_nodes: 64,
            quorum_nodes: 1,
            network_timeout_ms: 5000,
            reconnect_interval_ms: 1000,
        }
    }
}

/// Storage-plane settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub block_size: u32,
    pub cache_size: u64,
    pub io_threads: u32,
    pub default_replication_factor: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            block_size: 4096,
            cache_size: 64 << 20,
            io_threads: 1,
            default_replication_factor: 1,
        }
    }
}

/// Optional NVMe-oF target settings, consumed by the external re-exposer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct NvmfConfig {
    pub target_nqn: String,
    pub listen_port: u16,
}

impl Default for NvmfConfig {
    fn default() -> Self {
        Self {
            target_nqn: String::new(),
            listen_port: 4420,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterConfig, NodeConfig};

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg: NodeConfig = serde_json::from_str(r#"{"node_name":"n1"}"#).unwrap();
        assert_eq!(cfg.node_name, "n1");
        assert_eq!(cfg.bind_ip, "0.0.0.0");
        assert_eq!(cfg.port, 7700);
        assert_eq!(cfg.data_dir, "/var/lib/xsan");
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let cfg: ClusterConfig =
            serde_json::from_str(r#"{"cluster_name":"c1","future_knob":true}"#).unwrap();
        assert_eq!(cfg.cluster_name, "c1");
        assert_eq!(cfg.quorum_nodes, 1);
    }
}
