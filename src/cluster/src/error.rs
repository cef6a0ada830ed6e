use storage::{DecodeError, RecordId, RecordVersion, StorageError};
use thiserror::Error;

use crate::state::TaskState;

/// Errors surfaced by the replicated-task layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The record moved away from the version the task expected.
    #[error("concurrent modification of {rid}: expected v.{expected}, found v.{observed}")]
    VersionConflict {
        rid: RecordId,
        expected: RecordVersion,
        observed: RecordVersion,
    },

    #[error("{operation} on {rid}: record does not exist")]
    RecordMissing { operation: &'static str, rid: RecordId },

    #[error("quorum not reached for {operation} on {rid}: {successes}/{required} replicas succeeded")]
    QuorumNotReached {
        operation: &'static str,
        rid: RecordId,
        successes: usize,
        required: usize,
    },

    /// A compensating task also missed its quorum. Replicas are left diverged.
    #[error("compensation {operation} on {rid} failed: {successes}/{required} replicas succeeded")]
    CompensationFailed {
        operation: &'static str,
        rid: RecordId,
        successes: usize,
        required: usize,
    },

    #[error("cannot build compensation for {operation} on {rid}: {reason}")]
    CompensationUnavailable {
        operation: &'static str,
        rid: RecordId,
        reason: &'static str,
    },

    /// The coordinator's own replica failed to run the task.
    #[error("local execution of {operation} on {rid} failed: {message}")]
    Execution {
        operation: &'static str,
        rid: RecordId,
        message: String,
    },

    #[error("compensation task aborted: {0}")]
    Aborted(String),

    #[error("invalid task state transition {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
