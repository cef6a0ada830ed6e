//! Replicated record tasks.
//!
//! A [`RecordTask`] names a record, the version the coordinator expects it to
//! be at, and what to do with it. Every kind executes against a replica's
//! [`Storage`] behind an optimistic version check, declares the quorum it
//! needs, and knows how to build the task that reverses it.

use storage::{RecordId, RecordSnapshot, RecordVersion, Storage, StorageError};

use crate::error::ClusterError;
use crate::outcome::ExecutionOutcome;
use crate::quorum::QuorumType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Store a new record at `new_version`. Expects the record to be absent.
    Create { content: Vec<u8>, new_version: RecordVersion },
    /// Replace content; `new_version` is fixed by the coordinator so every
    /// replica lands on the same version.
    Update { content: Vec<u8>, new_version: RecordVersion },
    /// Move the record into the holding area until quorum is confirmed.
    Delete,
    /// Bring a record back out of the holding area.
    Resurrect,
    /// Write an arbitrary snapshot, including an older version. Issued only
    /// as a fix for diverged replicas.
    Overwrite { content: Vec<u8>, new_version: RecordVersion },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTask {
    pub rid: RecordId,
    /// Version the record must be at for the task to apply.
    pub version: RecordVersion,
    pub kind: TaskKind,
}

impl RecordTask {
    pub fn create(rid: RecordId, content: impl Into<Vec<u8>>, new_version: RecordVersion) -> Self {
        RecordTask {
            rid,
            version: RecordVersion::Untracked,
            kind: TaskKind::Create {
                content: content.into(),
                new_version,
            },
        }
    }

    pub fn update(rid: RecordId, expected: RecordVersion, content: impl Into<Vec<u8>>) -> Self {
        RecordTask {
            rid,
            version: expected,
            kind: TaskKind::Update {
                content: content.into(),
                new_version: expected.next(),
            },
        }
    }

    pub fn delete(rid: RecordId, version: RecordVersion) -> Self {
        RecordTask { rid, version, kind: TaskKind::Delete }
    }

    pub fn resurrect(rid: RecordId, version: RecordVersion) -> Self {
        RecordTask { rid, version, kind: TaskKind::Resurrect }
    }

    pub fn overwrite(rid: RecordId, expected: RecordVersion, target: RecordSnapshot) -> Self {
        RecordTask {
            rid,
            version: expected,
            kind: TaskKind::Overwrite {
                content: target.content,
                new_version: target.version,
            },
        }
    }

    /// Stable label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self.kind {
            TaskKind::Create { .. } => "record_create",
            TaskKind::Update { .. } => "record_update",
            TaskKind::Delete => "record_delete",
            TaskKind::Resurrect => "record_resurrect",
            TaskKind::Overwrite { .. } => "record_fix_update",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self.kind, TaskKind::Create { .. })
    }

    pub fn quorum_type(&self) -> QuorumType {
        match self.kind {
            TaskKind::Create { .. }
            | TaskKind::Update { .. }
            | TaskKind::Delete
            | TaskKind::Resurrect
            | TaskKind::Overwrite { .. } => QuorumType::Write,
        }
    }

    /// Version the record is at once this task has applied.
    pub fn resulting_version(&self) -> RecordVersion {
        match &self.kind {
            TaskKind::Create { new_version, .. }
            | TaskKind::Update { new_version, .. }
            | TaskKind::Overwrite { new_version, .. } => *new_version,
            TaskKind::Delete => RecordVersion::Untracked,
            TaskKind::Resurrect => self.version,
        }
    }

    /// Apply this task to a replica's storage.
    ///
    /// The caller must hold the record's execution slot. On a version mismatch
    /// nothing is written and a `Conflict` outcome carries the version found.
    pub async fn execute(&self, storage: &Storage) -> Result<ExecutionOutcome, StorageError> {
        let current = storage.load(&self.rid).await;

        match &self.kind {
            TaskKind::Create { content, new_version } => {
                if let Some(current) = current {
                    return Ok(conflict(current.version));
                }
                if let Some(pending) = storage.deferred_version(&self.rid).await {
                    return Ok(conflict(pending));
                }
                storage.apply_create(self.rid, content.clone(), *new_version).await?;
                Ok(ExecutionOutcome::Applied {
                    before: None,
                    after: Some(RecordSnapshot::new(content.clone(), *new_version)),
                })
            }
            TaskKind::Update { content, new_version } | TaskKind::Overwrite { content, new_version } => {
                let before = match current {
                    Some(current) if current.version == self.version => current,
                    Some(current) => return Ok(conflict(current.version)),
                    None => return Ok(conflict(RecordVersion::Untracked)),
                };
                storage.apply_update(self.rid, content.clone(), *new_version).await?;
                Ok(ExecutionOutcome::Applied {
                    before: Some(before),
                    after: Some(RecordSnapshot::new(content.clone(), *new_version)),
                })
            }
            TaskKind::Delete => {
                let before = match current {
                    Some(current) if current.version == self.version => current,
                    Some(current) => return Ok(conflict(current.version)),
                    None => return Ok(conflict(RecordVersion::Untracked)),
                };
                // postponed so it can be undone if quorum is not reached
                if !storage.push_deferred_delete(self.rid, self.version).await {
                    return Ok(conflict(storage.version_of(&self.rid).await));
                }
                Ok(ExecutionOutcome::Applied {
                    before: Some(before),
                    after: None,
                })
            }
            TaskKind::Resurrect => {
                if let Some(current) = current {
                    return Ok(conflict(current.version));
                }
                match storage.deferred_version(&self.rid).await {
                    Some(pending) if pending == self.version => {}
                    Some(pending) => return Ok(conflict(pending)),
                    None => return Ok(conflict(RecordVersion::Untracked)),
                }
                let Some(held) = storage.pop_deferred_delete(&self.rid).await else {
                    return Ok(conflict(RecordVersion::Untracked));
                };
                storage.apply_update(self.rid, held.content.clone(), held.version).await?;
                Ok(ExecutionOutcome::Applied {
                    before: None,
                    after: Some(held),
                })
            }
        }
    }

    /// Task that brings a replica in `bad` state in line with one in `good` state.
    pub fn fix_task(&self, bad: &ExecutionOutcome, good: &ExecutionOutcome) -> Result<RecordTask, ClusterError> {
        match &self.kind {
            TaskKind::Create { .. } | TaskKind::Delete | TaskKind::Resurrect => self.undo_task(bad),
            TaskKind::Update { .. } | TaskKind::Overwrite { .. } => match good {
                ExecutionOutcome::Applied { after: Some(target), .. } => {
                    let current = bad.observed_version().unwrap_or_else(|| self.resulting_version());
                    Ok(RecordTask::overwrite(self.rid, current, target.clone()))
                }
                _ => self.undo_task(bad),
            },
        }
    }

    /// Best-effort reversal of this task on a replica that applied it.
    pub fn undo_task(&self, bad: &ExecutionOutcome) -> Result<RecordTask, ClusterError> {
        match &self.kind {
            TaskKind::Create { new_version, .. } => Ok(RecordTask::delete(self.rid, *new_version)),
            TaskKind::Delete => Ok(RecordTask::resurrect(self.rid, self.version)),
            TaskKind::Resurrect => Ok(RecordTask::delete(self.rid, self.version)),
            TaskKind::Update { new_version, .. } | TaskKind::Overwrite { new_version, .. } => match bad {
                ExecutionOutcome::Applied { before: Some(previous), .. } => {
                    Ok(RecordTask::overwrite(self.rid, *new_version, previous.clone()))
                }
                _ => Err(ClusterError::CompensationUnavailable {
                    operation: self.name(),
                    rid: self.rid,
                    reason: "outcome carries no previous snapshot",
                }),
            },
        }
    }
}

fn conflict(observed: RecordVersion) -> ExecutionOutcome {
    ExecutionOutcome::Conflict { observed }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid() -> RecordId {
        RecordId::new(10, 5)
    }

    async fn storage_with(content: &str, version: RecordVersion) -> Storage {
        let storage = Storage::new();
        storage.apply_create(rid(), content.as_bytes().to_vec(), version).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_delete_is_deferred() {
        let storage = storage_with("doc", RecordVersion::Simple(3)).await;
        let task = RecordTask::delete(rid(), RecordVersion::Simple(3));

        let outcome = task.execute(&storage).await.unwrap();
        assert!(outcome.is_applied());
        assert!(storage.load(&rid()).await.is_none());
        assert_eq!(storage.deferred_version(&rid()).await, Some(RecordVersion::Simple(3)));
    }

    #[tokio::test]
    async fn test_delete_conflict_leaves_record() {
        let storage = storage_with("doc", RecordVersion::Simple(4)).await;
        let task = RecordTask::delete(rid(), RecordVersion::Simple(3));

        let outcome = task.execute(&storage).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Conflict { observed: RecordVersion::Simple(4) });
        assert_eq!(storage.version_of(&rid()).await, RecordVersion::Simple(4));
        assert_eq!(storage.deferred_len().await, 0);
    }

    #[tokio::test]
    async fn test_delete_then_resurrect_restores_record() {
        let storage = storage_with("doc", RecordVersion::Simple(3)).await;
        let delete = RecordTask::delete(rid(), RecordVersion::Simple(3));
        let outcome = delete.execute(&storage).await.unwrap();

        let undo = delete.undo_task(&outcome).unwrap();
        assert_eq!(undo, RecordTask::resurrect(rid(), RecordVersion::Simple(3)));
        assert!(undo.execute(&storage).await.unwrap().is_applied());

        assert_eq!(
            storage.load(&rid()).await,
            Some(RecordSnapshot::new("doc", RecordVersion::Simple(3)))
        );
        assert_eq!(storage.deferred_len().await, 0);
    }

    #[tokio::test]
    async fn test_update_undo_restores_previous_snapshot() {
        let storage = storage_with("old", RecordVersion::Simple(1)).await;
        let update = RecordTask::update(rid(), RecordVersion::Simple(1), "new");

        let outcome = update.execute(&storage).await.unwrap();
        assert_eq!(storage.version_of(&rid()).await, RecordVersion::Simple(2));

        let undo = update.undo_task(&outcome).unwrap();
        assert_eq!(undo.name(), "record_fix_update");
        assert!(undo.execute(&storage).await.unwrap().is_applied());
        assert_eq!(
            storage.load(&rid()).await,
            Some(RecordSnapshot::new("old", RecordVersion::Simple(1)))
        );
    }

    #[tokio::test]
    async fn test_update_fix_converges_to_good_replica() {
        let storage = storage_with("old", RecordVersion::Simple(1)).await;
        let update = RecordTask::update(rid(), RecordVersion::Simple(1), "new");
        let bad = update.execute(&storage).await.unwrap();

        let good = ExecutionOutcome::Applied {
            before: None,
            after: Some(RecordSnapshot::new("winner", RecordVersion::Simple(7))),
        };
        let fix = update.fix_task(&bad, &good).unwrap();
        assert_eq!(fix.version, RecordVersion::Simple(2));
        fix.execute(&storage).await.unwrap();

        assert_eq!(
            storage.load(&rid()).await,
            Some(RecordSnapshot::new("winner", RecordVersion::Simple(7)))
        );
    }

    #[tokio::test]
    async fn test_create_undo_removes_record() {
        let storage = Storage::new();
        let create = RecordTask::create(rid(), "doc", RecordVersion::initial());
        let outcome = create.execute(&storage).await.unwrap();
        assert!(outcome.is_applied());

        let undo = create.undo_task(&outcome).unwrap();
        assert_eq!(undo, RecordTask::delete(rid(), RecordVersion::initial()));
        undo.execute(&storage).await.unwrap();
        storage.finalize_delete(&rid()).await.unwrap();

        assert!(storage.load(&rid()).await.is_none());
        assert_eq!(storage.deferred_len().await, 0);
    }

    #[tokio::test]
    async fn test_create_conflicts_with_existing_or_pending_record() {
        let storage = storage_with("doc", RecordVersion::Simple(0)).await;
        let create = RecordTask::create(rid(), "again", RecordVersion::initial());
        assert!(create.execute(&storage).await.unwrap().is_conflict());

        storage.push_deferred_delete(rid(), RecordVersion::Simple(0)).await;
        assert_eq!(
            create.execute(&storage).await.unwrap(),
            ExecutionOutcome::Conflict { observed: RecordVersion::Simple(0) }
        );
    }

    #[tokio::test]
    async fn test_reexecution_against_moved_record_conflicts() {
        let storage = storage_with("a", RecordVersion::Simple(1)).await;
        let update = RecordTask::update(rid(), RecordVersion::Simple(1), "b");

        assert!(update.execute(&storage).await.unwrap().is_applied());
        assert_eq!(
            update.execute(&storage).await.unwrap(),
            ExecutionOutcome::Conflict { observed: RecordVersion::Simple(2) }
        );
        assert_eq!(storage.load(&rid()).await.unwrap().content, b"b");
    }

    #[tokio::test]
    async fn test_resurrect_without_holding_entry_conflicts() {
        let storage = Storage::new();
        let task = RecordTask::resurrect(rid(), RecordVersion::Simple(3));
        assert_eq!(
            task.execute(&storage).await.unwrap(),
            ExecutionOutcome::Conflict { observed: RecordVersion::Untracked }
        );
    }

    #[test]
    fn test_compensation_kinds_are_total() {
        let v = RecordVersion::Simple(2);
        let applied = ExecutionOutcome::Applied {
            before: Some(RecordSnapshot::new("prev", RecordVersion::Simple(1))),
            after: Some(RecordSnapshot::new("next", v)),
        };
        let tasks = [
            RecordTask::create(rid(), "x", RecordVersion::initial()),
            RecordTask::update(rid(), RecordVersion::Simple(1), "x"),
            RecordTask::delete(rid(), v),
            RecordTask::resurrect(rid(), v),
            RecordTask::overwrite(rid(), v, RecordSnapshot::new("x", RecordVersion::Simple(1))),
        ];
        for task in tasks {
            assert_eq!(task.quorum_type(), QuorumType::Write);
            assert!(task.undo_task(&applied).is_ok(), "{} has no undo", task.name());
            assert!(task.fix_task(&applied, &applied).is_ok(), "{} has no fix", task.name());
        }
    }

    #[test]
    fn test_update_undo_needs_previous_snapshot() {
        let update = RecordTask::update(rid(), RecordVersion::Simple(1), "x");
        let err = update
            .undo_task(&ExecutionOutcome::Conflict { observed: RecordVersion::Simple(1) })
            .unwrap_err();
        assert!(matches!(err, ClusterError::CompensationUnavailable { .. }));
    }
}
