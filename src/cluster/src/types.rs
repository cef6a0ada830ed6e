use crate::error::ClusterError;

/// Replicas are addressed by node id.
pub type ReplicaId = String;

/// Operation codes for the replica protocol
pub const CLUSTER_OP_TASK: u8 = 1;
pub const CLUSTER_OP_TASK_ACK: u8 = 2;
pub const CLUSTER_OP_CONFIRM: u8 = 3;
pub const CLUSTER_OP_CONFIRM_ACK: u8 = 4;

/// A remote replica as listed in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    pub id: ReplicaId,
    pub host: String,
    pub cluster_port: u16,
}

impl PeerNode {
    pub fn new(id: impl Into<String>, host: impl Into<String>, cluster_port: u16) -> Self {
        PeerNode {
            id: id.into(),
            host: host.into(),
            cluster_port,
        }
    }

    /// Parse `id@host:port`.
    pub fn parse(spec: &str) -> Result<Self, ClusterError> {
        let spec = spec.trim();
        let (id, addr) = spec
            .split_once('@')
            .ok_or_else(|| ClusterError::Config(format!("replica '{}' is not id@host:port", spec)))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::Config(format!("replica '{}' has no port", spec)))?;
        let cluster_port = port
            .parse()
            .map_err(|_| ClusterError::Config(format!("replica '{}' has invalid port '{}'", spec, port)))?;

        if id.is_empty() || host.is_empty() {
            return Err(ClusterError::Config(format!("replica '{}' is not id@host:port", spec)));
        }
        Ok(PeerNode::new(id, host, cluster_port))
    }

    pub fn cluster_addr(&self) -> String {
        format!("{}:{}", self.host, self.cluster_port)
    }
}
