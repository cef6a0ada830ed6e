use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use log::{debug, info};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::types::{RecordId, RecordSnapshot};
use crate::version::RecordVersion;
use crate::wal::{Wal, WalEntry};

#[derive(Default)]
struct Records {
    live: HashMap<RecordId, RecordSnapshot>,
    /// Deletes that passed their version check but still wait for quorum.
    /// Entries here are invisible to `load` and can be resurrected.
    deferred: HashMap<RecordId, RecordSnapshot>,
}

/// Local record store of one replica.
///
/// Holds the live records and the pending-deletion holding area behind one
/// tokio `RwLock`, and optionally appends every put and physical delete to a
/// write-ahead log. The store itself does no version checking; callers
/// compare versions before mutating.
#[derive(Clone)]
pub struct Storage {
    records: Arc<RwLock<Records>>,
    wal: Arc<Mutex<Wal>>,
}

impl Storage {
    /// Create a new in-memory storage (no persistence).
    pub fn new() -> Self {
        info!("Initializing in-memory record storage");
        Storage {
            records: Arc::new(RwLock::new(Records::default())),
            wal: Arc::new(Mutex::new(Wal::disabled())),
        }
    }

    /// Create storage with configuration, replaying the WAL if one is configured.
    pub fn with_config(config: StorageConfig) -> Result<Self, StorageError> {
        let Some(path) = config.wal_path else {
            return Ok(Self::new());
        };

        let wal = Wal::new(&path)?;
        let mut records = Records::default();
        let entries = wal.read_entries()?;
        let replayed = entries.len();
        for entry in entries {
            match entry {
                WalEntry::Put { rid, version, content } => {
                    records.live.insert(rid, RecordSnapshot { content, version });
                }
                WalEntry::Delete { rid } => {
                    records.live.remove(&rid);
                }
            }
        }

        info!(
            "Record storage restored from {} ({} entries, {} records)",
            path,
            replayed,
            records.live.len()
        );

        Ok(Storage {
            records: Arc::new(RwLock::new(records)),
            wal: Arc::new(Mutex::new(wal)),
        })
    }

    fn wal(&self) -> MutexGuard<'_, Wal> {
        self.wal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load a live record. Records waiting in the holding area are not returned.
    pub async fn load(&self, rid: &RecordId) -> Option<RecordSnapshot> {
        self.records.read().await.live.get(rid).cloned()
    }

    /// Current version of a live record, `Untracked` if it does not exist.
    pub async fn version_of(&self, rid: &RecordId) -> RecordVersion {
        self.records
            .read()
            .await
            .live
            .get(rid)
            .map(|r| r.version)
            .unwrap_or(RecordVersion::Untracked)
    }

    /// Store a new record.
    pub async fn apply_create(
        &self,
        rid: RecordId,
        content: Vec<u8>,
        version: RecordVersion,
    ) -> Result<(), StorageError> {
        self.put(rid, RecordSnapshot { content, version }).await
    }

    /// Replace the content of a record and move it to `new_version`.
    pub async fn apply_update(
        &self,
        rid: RecordId,
        content: Vec<u8>,
        new_version: RecordVersion,
    ) -> Result<(), StorageError> {
        self.put(rid, RecordSnapshot { content, version: new_version }).await
    }

    async fn put(&self, rid: RecordId, snapshot: RecordSnapshot) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        self.wal().log_put(rid, &snapshot)?;
        records.live.insert(rid, snapshot);
        Ok(())
    }

    /// Move a live record at `version` into the holding area.
    ///
    /// Returns false, changing nothing, when the record is absent or at
    /// another version.
    pub async fn push_deferred_delete(&self, rid: RecordId, version: RecordVersion) -> bool {
        let mut records = self.records.write().await;
        match records.live.get(&rid) {
            Some(current) if current.version == version => {}
            _ => return false,
        }
        if let Some(snapshot) = records.live.remove(&rid) {
            debug!("Deferred delete of {} v.{}", rid, version);
            records.deferred.insert(rid, snapshot);
        }
        true
    }

    /// Version of the holding-area entry for `rid`, if any.
    pub async fn deferred_version(&self, rid: &RecordId) -> Option<RecordVersion> {
        self.records.read().await.deferred.get(rid).map(|r| r.version)
    }

    /// Take a record back out of the holding area.
    pub async fn pop_deferred_delete(&self, rid: &RecordId) -> Option<RecordSnapshot> {
        self.records.write().await.deferred.remove(rid)
    }

    /// Physically delete a record held in the holding area.
    pub async fn finalize_delete(&self, rid: &RecordId) -> Result<Option<RecordSnapshot>, StorageError> {
        let mut records = self.records.write().await;
        let Some(snapshot) = records.deferred.remove(rid) else {
            return Ok(None);
        };
        self.wal().log_delete(*rid)?;
        debug!("Finalized delete of {} v.{}", rid, snapshot.version);
        Ok(Some(snapshot))
    }

    /// Number of live records.
    pub async fn len(&self) -> usize {
        self.records.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.live.is_empty()
    }

    /// Number of records waiting in the holding area.
    pub async fn deferred_len(&self) -> usize {
        self.records.read().await.deferred.len()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid() -> RecordId {
        RecordId::new(10, 5)
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let storage = Storage::new();
        assert_eq!(storage.version_of(&rid()).await, RecordVersion::Untracked);

        storage.apply_create(rid(), b"doc".to_vec(), RecordVersion::Simple(0)).await.unwrap();
        let loaded = storage.load(&rid()).await.unwrap();
        assert_eq!(loaded.content, b"doc");
        assert_eq!(loaded.version, RecordVersion::Simple(0));
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_deferred_delete_hides_record() {
        let storage = Storage::new();
        storage.apply_create(rid(), b"doc".to_vec(), RecordVersion::Simple(3)).await.unwrap();

        assert!(storage.push_deferred_delete(rid(), RecordVersion::Simple(3)).await);
        assert!(storage.load(&rid()).await.is_none());
        assert_eq!(storage.deferred_version(&rid()).await, Some(RecordVersion::Simple(3)));

        let popped = storage.pop_deferred_delete(&rid()).await.unwrap();
        assert_eq!(popped, RecordSnapshot::new("doc", RecordVersion::Simple(3)));
        assert_eq!(storage.deferred_len().await, 0);
    }

    #[tokio::test]
    async fn test_deferred_delete_wrong_version_is_noop() {
        let storage = Storage::new();
        storage.apply_create(rid(), b"doc".to_vec(), RecordVersion::Simple(4)).await.unwrap();

        assert!(!storage.push_deferred_delete(rid(), RecordVersion::Simple(3)).await);
        assert!(storage.load(&rid()).await.is_some());
        assert_eq!(storage.deferred_len().await, 0);
    }

    #[tokio::test]
    async fn test_finalize_removes_holding_entry() {
        let storage = Storage::new();
        storage.apply_create(rid(), b"doc".to_vec(), RecordVersion::Simple(1)).await.unwrap();
        storage.push_deferred_delete(rid(), RecordVersion::Simple(1)).await;

        assert!(storage.finalize_delete(&rid()).await.unwrap().is_some());
        assert!(storage.finalize_delete(&rid()).await.unwrap().is_none());
        assert!(storage.is_empty().await);
        assert_eq!(storage.deferred_len().await, 0);
    }

    #[tokio::test]
    async fn test_wal_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.wal");
        let kept = RecordId::new(1, 1);
        let dropped = RecordId::new(1, 2);
        let pending = RecordId::new(1, 3);

        {
            let storage = Storage::with_config(StorageConfig::with_wal(&path)).unwrap();
            storage.apply_create(kept, b"a".to_vec(), RecordVersion::Simple(0)).await.unwrap();
            storage.apply_update(kept, b"b".to_vec(), RecordVersion::Simple(1)).await.unwrap();
            storage.apply_create(dropped, b"c".to_vec(), RecordVersion::Simple(0)).await.unwrap();
            storage.push_deferred_delete(dropped, RecordVersion::Simple(0)).await;
            storage.finalize_delete(&dropped).await.unwrap();
            storage.apply_create(pending, b"d".to_vec(), RecordVersion::Simple(0)).await.unwrap();
            storage.push_deferred_delete(pending, RecordVersion::Simple(0)).await;
        }

        let storage = Storage::with_config(StorageConfig::with_wal(&path)).unwrap();
        assert_eq!(
            storage.load(&kept).await,
            Some(RecordSnapshot::new("b", RecordVersion::Simple(1)))
        );
        assert!(storage.load(&dropped).await.is_none());
        // an unfinalized delete never reached the log
        assert!(storage.load(&pending).await.is_some());
    }
}
