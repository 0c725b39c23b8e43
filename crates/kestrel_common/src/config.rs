use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Top-level coordinator configuration, loaded from `kestrel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub txn: TxnConfig,
    /// Data nodes this coordinator can route to.
    #[serde(default)]
    pub nodes: Vec<DataNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name of this coordinator, used in gids and startup parameters.
    pub node_name: String,
    /// Prefix of generated global transaction identifiers.
    pub gid_prefix: String,
    /// Prometheus listen address.
    pub metrics_listen_addr: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_name: "coord1".into(),
            gid_prefix: "T".into(),
            metrics_listen_addr: "0.0.0.0:9190".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Timeout for one acquisition round-trip (milliseconds, 0 = none).
    pub acquire_timeout_ms: u64,
    /// Idle sockets kept per data node for reuse.
    pub max_idle_per_node: usize,
    /// User name sent in the startup packet.
    pub user: String,
    /// Database name sent in the startup packet.
    pub database: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
            max_idle_per_node: 8,
            user: "kestrel".into(),
            database: "postgres".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Use Parse/Bind/Execute instead of simple Query for statements that
    /// carry a statement name or parameters.
    pub extended_protocol: bool,
    /// Rows requested per Execute when merge-sorting node streams.
    pub merge_sort_batch_rows: u32,
    /// Receive timeout while waiting on a connection set (milliseconds, 0 = none).
    /// Connections that time out are marked fatal.
    pub receive_timeout_ms: u64,
    /// Upper bound on a single backend frame.
    pub max_frame_bytes: usize,
    /// Send the global transaction id to a node before BEGIN.
    pub send_gxid: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            extended_protocol: true,
            merge_sort_batch_rows: 1_000,
            receive_timeout_ms: 0,
            max_frame_bytes: 64 * 1024 * 1024,
            send_gxid: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Use two-phase commit when more than one node wrote. When false every
    /// commit is a plain COMMIT fan-out (partial commits become possible).
    pub enforce_two_phase: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            enforce_two_phase: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeConfig {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Writes to replicated tables go here first.
    #[serde(default)]
    pub primary: bool,
    /// Reads of replicated tables prefer this node.
    #[serde(default)]
    pub preferred: bool,
}

impl DataNodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.id)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl KestrelConfig {
    pub fn node(&self, id: NodeId) -> Option<&DataNodeConfig> {
        self.nodes.iter().find(|n| n.node_id() == id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(DataNodeConfig::node_id).collect()
    }

    pub fn primary_node(&self) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.primary).map(DataNodeConfig::node_id)
    }

    pub fn preferred_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.preferred)
            .map(DataNodeConfig::node_id)
            .collect()
    }

    /// Validate the configuration. Returns an error message on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.coordinator.node_name.is_empty() {
            return Err("coordinator.node_name must not be empty".into());
        }
        if self.coordinator.gid_prefix.is_empty()
            || self.coordinator.gid_prefix.contains('\'')
        {
            return Err("coordinator.gid_prefix must be non-empty and contain no quotes".into());
        }
        if self.executor.merge_sort_batch_rows == 0 {
            return Err("executor.merge_sort_batch_rows must be >= 1".into());
        }
        if self.executor.max_frame_bytes < 1024 {
            return Err("executor.max_frame_bytes must be >= 1024".into());
        }

        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id) {
                return Err(format!("duplicate data node id {}", node.id));
            }
            if !seen_names.insert(node.name.as_str()) {
                return Err(format!("duplicate data node name '{}'", node.name));
            }
            if node.port == 0 {
                return Err(format!("data node '{}' has port 0", node.name));
            }
        }
        if self.nodes.iter().filter(|n| n.primary).count() > 1 {
            return Err("at most one data node may be marked primary".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, name: &str) -> DataNodeConfig {
        DataNodeConfig {
            id,
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 15432 + id as u16,
            primary: false,
            preferred: false,
        }
    }

    #[test]
    fn test_default_is_valid() {
        assert!(KestrelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [executor]
            merge_sort_batch_rows = 50

            [[nodes]]
            id = 1
            name = "dn1"
            host = "10.0.0.1"
            port = 5432
            primary = true

            [[nodes]]
            id = 2
            name = "dn2"
            host = "10.0.0.2"
            port = 5432
            preferred = true
        "#;
        let config: KestrelConfig = toml::from_str(text).unwrap();
        assert_eq!(config.executor.merge_sort_batch_rows, 50);
        assert!(config.executor.extended_protocol);
        assert_eq!(config.primary_node(), Some(NodeId(1)));
        assert_eq!(config.preferred_nodes(), vec![NodeId(2)]);
        assert_eq!(config.node(NodeId(2)).unwrap().address(), "10.0.0.2:5432");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicate_ids_and_two_primaries() {
        let mut config = KestrelConfig::default();
        config.nodes = vec![node(1, "dn1"), node(1, "dn2")];
        assert!(config.validate().is_err());

        let mut a = node(1, "dn1");
        let mut b = node(2, "dn2");
        a.primary = true;
        b.primary = true;
        config.nodes = vec![a, b];
        assert!(config.validate().unwrap_err().contains("primary"));
    }

    #[test]
    fn test_rejects_quoted_gid_prefix() {
        let mut config = KestrelConfig::default();
        config.coordinator.gid_prefix = "T'".into();
        assert!(config.validate().is_err());
    }
}
