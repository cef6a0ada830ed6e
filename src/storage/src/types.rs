use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;
use crate::version::RecordVersion;

/// Cluster-wide record identity: the cluster a record lives in and its
/// position inside that cluster. Rendered as `#<cluster>:<position>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub cluster: i16,
    pub position: i64,
}

impl RecordId {
    pub fn new(cluster: i16, position: i64) -> Self {
        RecordId { cluster, position }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl FromStr for RecordId {
    type Err = DecodeError;

    /// Accepts `#10:5` and `10:5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DecodeError::InvalidRecordId(s.to_string());
        let body = s.trim().strip_prefix('#').unwrap_or(s.trim());
        let (cluster, position) = body.split_once(':').ok_or_else(invalid)?;
        let cluster = cluster.parse::<i16>().map_err(|_| invalid())?;
        let position = position.parse::<i64>().map_err(|_| invalid())?;
        Ok(RecordId { cluster, position })
    }
}

/// Content of a record together with the version it is stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub content: Vec<u8>,
    pub version: RecordVersion,
}

impl RecordSnapshot {
    pub fn new(content: impl Into<Vec<u8>>, version: RecordVersion) -> Self {
        RecordSnapshot {
            content: content.into(),
            version,
        }
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
