use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use storage::{RecordId, Storage};
use tokio::sync::{Mutex, MutexGuard};

use crate::diagnostics::{trace_task, Direction};
use crate::error::ClusterError;
use crate::outcome::ExecutionOutcome;
use crate::task::{RecordTask, TaskKind};

/// Runs tasks against this node's storage.
///
/// Execution is serialized per record through a table of async mutexes, so
/// tasks for one record apply in arrival order while different records run
/// in parallel.
pub struct LocalExecutor {
    node_id: String,
    storage: Storage,
    slots: DashMap<RecordId, Arc<Mutex<()>>>,
}

impl LocalExecutor {
    pub fn new(node_id: impl Into<String>, storage: Storage) -> Self {
        LocalExecutor {
            node_id: node_id.into(),
            storage,
            slots: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub async fn execute(&self, task: &RecordTask) -> ExecutionOutcome {
        trace_task(&self.node_id, Direction::In, task);

        let slot = self.slot(task.rid);
        let _guard = slot.lock().await;
        match task.execute(&self.storage).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[{}] {} on {} failed: {}", self.node_id, task.name(), task.rid, e);
                ExecutionOutcome::error(e.to_string())
            }
        }
    }

    /// Quorum reached for `task`. Finalizes a deferred delete still held at
    /// the task's version; every other kind is already durable.
    pub async fn confirm(&self, task: &RecordTask) -> Result<(), ClusterError> {
        if task.kind != TaskKind::Delete {
            return Ok(());
        }

        let slot = self.slot(task.rid);
        let finalized = {
            let _guard = slot.lock().await;
            if self.storage.deferred_version(&task.rid).await == Some(task.version) {
                self.storage.finalize_delete(&task.rid).await?;
                true
            } else {
                false
            }
        };
        drop(slot);

        if finalized {
            info!("[{}] Finalized delete of {} v.{}", self.node_id, task.rid, task.version);
        }
        Ok(())
    }

    fn slot(&self, rid: RecordId) -> SlotRef<'_> {
        SlotRef {
            executor: self,
            rid,
            slot: Some(self.slots.entry(rid).or_default().clone()),
        }
    }

    // Drop the slot once nobody else holds or waits on it.
    fn release(&self, rid: RecordId) {
        self.slots.remove_if(&rid, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// A reference to a record's slot that gives it back to the table when
/// dropped, including when the owning future is cancelled mid-wait.
struct SlotRef<'a> {
    executor: &'a LocalExecutor,
    rid: RecordId,
    slot: Option<Arc<Mutex<()>>>,
}

impl SlotRef<'_> {
    async fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.slot {
            Some(slot) => Some(slot.lock().await),
            None => None,
        }
    }
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        drop(self.slot.take());
        self.executor.release(self.rid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use storage::{RecordSnapshot, RecordVersion};

    fn rid() -> RecordId {
        RecordId::new(10, 5)
    }

    #[tokio::test]
    async fn test_confirm_finalizes_delete() {
        let executor = LocalExecutor::new("node1", Storage::new());
        executor
            .execute(&RecordTask::create(rid(), "doc", RecordVersion::Simple(3)))
            .await;

        let delete = RecordTask::delete(rid(), RecordVersion::Simple(3));
        assert!(executor.execute(&delete).await.is_applied());
        assert_eq!(executor.storage().deferred_len().await, 1);

        executor.confirm(&delete).await.unwrap();
        assert_eq!(executor.storage().deferred_len().await, 0);
        assert!(executor.storage().load(&rid()).await.is_none());
        assert!(executor.slots.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_slot() {
        let executor = LocalExecutor::new("node1", Storage::new());
        let create = RecordTask::create(rid(), "doc", RecordVersion::Simple(3));

        let held = executor.slot(rid());
        let guard = held.lock().await;

        // queued behind the held slot, then abandoned
        let mut waiting = Box::pin(executor.execute(&create));
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut waiting).await.is_err());

        drop(guard);
        drop(held);
        drop(waiting);

        assert!(executor.slots.is_empty());
        assert!(executor.storage().load(&rid()).await.is_none());
    }

    #[tokio::test]
    async fn test_confirm_ignores_stale_version() {
        let executor = LocalExecutor::new("node1", Storage::new());
        executor
            .execute(&RecordTask::create(rid(), "doc", RecordVersion::Simple(3)))
            .await;
        executor
            .execute(&RecordTask::delete(rid(), RecordVersion::Simple(3)))
            .await;

        executor
            .confirm(&RecordTask::delete(rid(), RecordVersion::Simple(2)))
            .await
            .unwrap();
        assert_eq!(executor.storage().deferred_len().await, 1);
    }

    #[tokio::test]
    async fn test_same_record_tasks_serialize() {
        let executor = Arc::new(LocalExecutor::new("node1", Storage::new()));
        executor
            .execute(&RecordTask::create(rid(), "v0", RecordVersion::Simple(0)))
            .await;

        // every update expects v.0, so exactly one may apply
        let mut handles = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                let task = RecordTask::update(rid(), RecordVersion::Simple(0), format!("v{}", i));
                executor.execute(&task).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.is_applied() {
                applied += 1;
            } else {
                assert_eq!(outcome, ExecutionOutcome::Conflict { observed: RecordVersion::Simple(1) });
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(executor.storage().version_of(&rid()).await, RecordVersion::Simple(1));
    }

    #[tokio::test]
    async fn test_resurrect_after_delete() {
        let executor = LocalExecutor::new("node1", Storage::new());
        executor
            .execute(&RecordTask::create(rid(), "doc", RecordVersion::Simple(3)))
            .await;
        executor
            .execute(&RecordTask::delete(rid(), RecordVersion::Simple(3)))
            .await;

        let outcome = executor
            .execute(&RecordTask::resurrect(rid(), RecordVersion::Simple(3)))
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Applied {
                before: None,
                after: Some(RecordSnapshot::new("doc", RecordVersion::Simple(3))),
            }
        );
    }
}
