use storage::{RecordSnapshot, RecordVersion};

use crate::error::ClusterError;
use crate::task::RecordTask;

/// Result of applying one task on one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The version check passed and the mutation was applied.
    ///
    /// `before` is the live record prior to the mutation and `after` the live
    /// record once applied; either is `None` when no live record exists.
    Applied {
        before: Option<RecordSnapshot>,
        after: Option<RecordSnapshot>,
    },
    /// The stored version did not match; nothing was changed.
    Conflict { observed: RecordVersion },
    /// The replica failed for a reason unrelated to versions.
    Error { message: String },
}

impl ExecutionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ExecutionOutcome::Applied { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ExecutionOutcome::Conflict { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ExecutionOutcome::Error { message: message.into() }
    }

    /// Version of the live record after this outcome, as far as it is known.
    pub fn observed_version(&self) -> Option<RecordVersion> {
        match self {
            ExecutionOutcome::Applied { after, .. } => Some(
                after
                    .as_ref()
                    .map(|s| s.version)
                    .unwrap_or(RecordVersion::Untracked),
            ),
            ExecutionOutcome::Conflict { observed } => Some(*observed),
            ExecutionOutcome::Error { .. } => None,
        }
    }

    /// Error view for callers that treat anything but `Applied` as a failure.
    ///
    /// A conflict at `Untracked` means the replica holds no record for a task
    /// that needs one, which is reported as `RecordMissing`.
    pub fn into_result(self, task: &RecordTask) -> Result<ExecutionOutcome, ClusterError> {
        match self {
            ExecutionOutcome::Conflict { observed: RecordVersion::Untracked } if !task.is_create() => {
                Err(ClusterError::RecordMissing {
                    operation: task.name(),
                    rid: task.rid,
                })
            }
            ExecutionOutcome::Conflict { observed } => Err(ClusterError::VersionConflict {
                rid: task.rid,
                expected: task.version,
                observed,
            }),
            ExecutionOutcome::Error { message } => Err(ClusterError::Execution {
                operation: task.name(),
                rid: task.rid,
                message,
            }),
            applied => Ok(applied),
        }
    }
}

/// What the transport reports for one replica of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaResponse {
    /// Answered before the deadline.
    Completed(ExecutionOutcome),
    /// No answer before the deadline.
    TimedOut,
    /// The replica could not be reached at all.
    Unreachable { reason: String },
    /// Answered after the deadline; not counted toward quorum.
    Late(ExecutionOutcome),
}

impl ReplicaResponse {
    /// The in-time outcome, if any.
    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        match self {
            ReplicaResponse::Completed(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// The outcome the replica reported, in time or late.
    pub fn reported(&self) -> Option<&ExecutionOutcome> {
        match self {
            ReplicaResponse::Completed(outcome) | ReplicaResponse::Late(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome().is_some_and(ExecutionOutcome::is_applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::RecordId;

    fn rid() -> RecordId {
        RecordId::new(10, 5)
    }

    #[test]
    fn test_conflict_on_absent_record_is_missing() {
        let task = RecordTask::update(rid(), RecordVersion::Simple(1), "doc");
        let err = ExecutionOutcome::Conflict { observed: RecordVersion::Untracked }
            .into_result(&task)
            .unwrap_err();

        assert!(matches!(err, ClusterError::RecordMissing { operation: "record_update", .. }));
        assert_eq!(err.to_string(), "record_update on #10:5: record does not exist");
    }

    #[test]
    fn test_conflict_on_live_record_reports_versions() {
        let task = RecordTask::delete(rid(), RecordVersion::Simple(3));
        let err = ExecutionOutcome::Conflict { observed: RecordVersion::Simple(4) }
            .into_result(&task)
            .unwrap_err();

        assert!(matches!(
            err,
            ClusterError::VersionConflict {
                expected: RecordVersion::Simple(3),
                observed: RecordVersion::Simple(4),
                ..
            }
        ));
    }

    #[test]
    fn test_replica_error_is_execution_error() {
        let task = RecordTask::delete(rid(), RecordVersion::Simple(3));
        let err = ExecutionOutcome::error("disk full").into_result(&task).unwrap_err();
        assert!(matches!(err, ClusterError::Execution { operation: "record_delete", .. }));

        let applied = ExecutionOutcome::Applied { before: None, after: None };
        assert_eq!(applied.clone().into_result(&task).unwrap(), applied);
    }
}
