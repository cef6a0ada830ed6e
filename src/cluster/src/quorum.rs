//! Commit decisions over per-replica outcomes.

use std::collections::HashMap;
use std::fmt;
use log::warn;

use crate::outcome::ReplicaResponse;
use crate::types::ReplicaId;

/// How many replica acknowledgements a task needs before it counts as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumType {
    /// Fire and forget: the coordinator's own outcome is enough.
    None,
    /// Majority of the replicas that answered.
    Read,
    /// Write quorum over every replica in the cluster.
    Write,
}

impl fmt::Display for QuorumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumType::None => write!(f, "none"),
            QuorumType::Read => write!(f, "read"),
            QuorumType::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Committed,
    Failed,
}

/// Verdict plus the counts it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumDecision {
    pub verdict: Verdict,
    pub successes: usize,
    pub required: usize,
    pub responders: usize,
}

impl QuorumDecision {
    pub fn is_committed(&self) -> bool {
        self.verdict == Verdict::Committed
    }
}

/// Smallest strict majority of `n`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Evaluates quorum for a fixed cluster size.
#[derive(Debug, Clone, Copy)]
pub struct QuorumResolver {
    cluster_size: usize,
    write_quorum: usize,
}

impl QuorumResolver {
    pub fn new(cluster_size: usize) -> Self {
        QuorumResolver {
            cluster_size,
            write_quorum: majority(cluster_size),
        }
    }

    /// Override the write quorum. Values below a strict majority or above the
    /// cluster size are clamped into that range.
    pub fn with_write_quorum(mut self, write_quorum: usize) -> Self {
        self.write_quorum = write_quorum.clamp(majority(self.cluster_size), self.cluster_size.max(1));
        self
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    /// Decide whether `responses` satisfy `quorum`.
    ///
    /// `responses` holds one entry per replica asked, the coordinator
    /// included, and is only evaluated once the coordinator's own outcome is
    /// known. Replicas missing from the map count as timed out.
    pub fn resolve(
        &self,
        quorum: QuorumType,
        responses: &HashMap<ReplicaId, ReplicaResponse>,
    ) -> QuorumDecision {
        for (replica, response) in responses {
            if let ReplicaResponse::Late(outcome) = response {
                warn!(
                    "Late response from {} ignored for quorum: {:?}",
                    replica, outcome
                );
            }
        }

        let successes = responses.values().filter(|r| r.is_success()).count();
        let responders = responses.values().filter(|r| r.outcome().is_some()).count();

        let (required, committed) = match quorum {
            QuorumType::None => (0, true),
            QuorumType::Read => {
                let required = majority(responders);
                (required, responders > 0 && successes >= required)
            }
            QuorumType::Write => (self.write_quorum, successes >= self.write_quorum),
        };

        QuorumDecision {
            verdict: if committed { Verdict::Committed } else { Verdict::Failed },
            successes,
            required,
            responders,
        }
    }
}
