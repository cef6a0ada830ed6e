use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ClusterError;
use crate::types::PeerNode;

const DEFAULT_CLUSTER_PORT: u16 = 2424;
const DEFAULT_QUORUM_TIMEOUT_MS: u64 = 3000;
const DEFAULT_LATE_TIMEOUT_MS: u64 = 10_000;

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub cluster_port: u16,
    /// Every other replica of the record store. The local node is not listed.
    pub replicas: Vec<PeerNode>,
    /// Deadline for gathering replica outcomes of one task.
    pub quorum_timeout: Duration,
    /// How long to keep waiting on replicas that missed the quorum deadline
    /// so their late outcomes can be confirmed or compensated.
    pub late_timeout: Duration,
    /// Overrides the default majority write quorum.
    pub write_quorum: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ClusterFile {
    node_id: String,
    cluster_port: Option<u16>,
    quorum_timeout_ms: Option<u64>,
    late_timeout_ms: Option<u64>,
    write_quorum: Option<usize>,
    #[serde(default)]
    replicas: Vec<String>,
}

impl ClusterConfig {
    pub fn new(node_id: impl Into<String>, replicas: Vec<PeerNode>) -> Self {
        ClusterConfig {
            node_id: node_id.into(),
            cluster_port: DEFAULT_CLUSTER_PORT,
            replicas,
            quorum_timeout: Duration::from_millis(DEFAULT_QUORUM_TIMEOUT_MS),
            late_timeout: Duration::from_millis(DEFAULT_LATE_TIMEOUT_MS),
            write_quorum: None,
        }
    }

    /// Reads `QUORRA_*` variables. Returns `Ok(None)` when no node id is set,
    /// meaning the node runs standalone.
    pub fn from_env() -> Result<Option<Self>, ClusterError> {
        let node_id = match std::env::var("QUORRA_NODE_ID") {
            Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => return Ok(None),
        };

        let cluster_port = match std::env::var("QUORRA_CLUSTER_PORT") {
            Ok(port) => port
                .parse()
                .map_err(|_| ClusterError::Config(format!("invalid QUORRA_CLUSTER_PORT '{}'", port)))?,
            Err(_) => DEFAULT_CLUSTER_PORT,
        };

        let replicas_str = std::env::var("QUORRA_REPLICAS").unwrap_or_default();
        let replicas = parse_replicas(replicas_str.split(','))?;

        let quorum_timeout = std::env::var("QUORRA_QUORUM_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_QUORUM_TIMEOUT_MS));

        let late_timeout = std::env::var("QUORRA_LATE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_LATE_TIMEOUT_MS));

        let write_quorum = std::env::var("QUORRA_WRITE_QUORUM")
            .ok()
            .and_then(|v| v.parse().ok());

        Ok(Some(ClusterConfig {
            node_id,
            cluster_port,
            replicas,
            quorum_timeout,
            late_timeout,
            write_quorum,
        }))
    }

    /// Load a TOML file of the form
    ///
    /// ```toml
    /// node_id = "node1"
    /// cluster_port = 2424
    /// quorum_timeout_ms = 3000
    /// late_timeout_ms = 10000
    /// replicas = ["node2@10.0.0.2:2424", "node3@10.0.0.3:2424"]
    /// ```
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ClusterError> {
        let file: ClusterFile =
            toml::from_str(raw).map_err(|e| ClusterError::Config(format!("invalid cluster file: {}", e)))?;

        Ok(ClusterConfig {
            node_id: file.node_id,
            cluster_port: file.cluster_port.unwrap_or(DEFAULT_CLUSTER_PORT),
            replicas: parse_replicas(file.replicas.iter().map(String::as_str))?,
            quorum_timeout: Duration::from_millis(file.quorum_timeout_ms.unwrap_or(DEFAULT_QUORUM_TIMEOUT_MS)),
            late_timeout: Duration::from_millis(file.late_timeout_ms.unwrap_or(DEFAULT_LATE_TIMEOUT_MS)),
            write_quorum: file.write_quorum,
        })
    }

    /// Replicas including the local node.
    pub fn cluster_size(&self) -> usize {
        self.replicas.len() + 1
    }

    pub fn replica_ids(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.id.clone()).collect()
    }
}

fn parse_replicas<'a>(specs: impl Iterator<Item = &'a str>) -> Result<Vec<PeerNode>, ClusterError> {
    specs
        .filter(|s| !s.trim().is_empty())
        .map(PeerNode::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let config = ClusterConfig::from_toml_str(
            r#"
            node_id = "node1"
            quorum_timeout_ms = 500
            late_timeout_ms = 2000
            write_quorum = 3
            replicas = ["node2@127.0.0.1:3002", "node3@127.0.0.1:3003"]
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, "node1");
        assert_eq!(config.cluster_port, DEFAULT_CLUSTER_PORT);
        assert_eq!(config.quorum_timeout, Duration::from_millis(500));
        assert_eq!(config.late_timeout, Duration::from_secs(2));
        assert_eq!(config.write_quorum, Some(3));
        assert_eq!(config.cluster_size(), 3);
        assert_eq!(config.replica_ids(), vec!["node2", "node3"]);
    }

    #[test]
    fn test_from_toml_bad_replica() {
        let err = ClusterConfig::from_toml_str("node_id = \"n\"\nreplicas = [\"nowhere\"]").unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(&path, "node_id = \"solo\"\ncluster_port = 4000\n").unwrap();

        let config = ClusterConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.cluster_port, 4000);
        assert_eq!(config.late_timeout, Duration::from_millis(DEFAULT_LATE_TIMEOUT_MS));
        assert!(config.replicas.is_empty());
    }
}
