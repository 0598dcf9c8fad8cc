//! Durable change queue for delta sync.
//!
//! Local mutations append CREATE/UPDATE/DELETE records here instead of
//! blocking on the network; the sync engine drains the queue in each pass.
//! Changes to the same entity coalesce within a cycle:
//! - a later UPDATE supersedes an earlier UPDATE (last wins)
//! - an UPDATE after a CREATE folds into the CREATE
//! - a DELETE after a CREATE cancels both (the remote never saw the entity)
//! - a DELETE after an UPDATE collapses to just the DELETE

use crate::entry::LogEntry;
use crate::storage::{CacheStorage, Result, StorageError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const PENDING_KEY: &str = "logbook.pending_changes";
pub const MIGRATED_KEY: &str = "logbook.sync_migrated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    LogbookEntry,
    Goal,
}

/// One pending change. `data` carries the full object for CREATE and the
/// partial diff for UPDATE; DELETE carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    #[serde(rename = "type")]
    pub change: ChangeType,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn created(entity_type: EntityType, entity_id: &str, data: serde_json::Value) -> Self {
        Self {
            change: ChangeType::Created,
            entity_type,
            entity_id: entity_id.to_string(),
            data: Some(data),
            enqueued_at: Utc::now(),
        }
    }

    pub fn updated(entity_type: EntityType, entity_id: &str, diff: serde_json::Value) -> Self {
        Self {
            change: ChangeType::Updated,
            entity_type,
            entity_id: entity_id.to_string(),
            data: Some(diff),
            enqueued_at: Utc::now(),
        }
    }

    pub fn deleted(entity_type: EntityType, entity_id: &str) -> Self {
        Self {
            change: ChangeType::Deleted,
            entity_type,
            entity_id: entity_id.to_string(),
            data: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Durable queue of pending changes, owned exclusively until drained.
pub struct ChangeQueue<S: CacheStorage + 'static> {
    storage: Arc<S>,
    pending: Mutex<Vec<ChangeRecord>>,
}

impl<S: CacheStorage + 'static> ChangeQueue<S> {
    /// Load the persisted queue. Corrupt or missing data starts empty.
    pub async fn load(storage: Arc<S>) -> Self {
        let pending = match storage.get(PENDING_KEY).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Discarding corrupt pending-change list: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read pending-change list: {}", e);
                Vec::new()
            }
        };
        Self {
            storage,
            pending: Mutex::new(pending),
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Append a change, coalescing against any queued change to the same
    /// entity, and persist the queue.
    pub async fn enqueue(&self, record: ChangeRecord) -> Result<()> {
        let mut pending = self.pending.lock().await;
        Self::coalesce(&mut pending, record);
        self.persist(&pending).await
    }

    fn coalesce(pending: &mut Vec<ChangeRecord>, record: ChangeRecord) {
        let existing_idx = pending
            .iter()
            .position(|r| r.entity_type == record.entity_type && r.entity_id == record.entity_id);

        let Some(idx) = existing_idx else {
            pending.push(record);
            return;
        };

        match (pending[idx].change, record.change) {
            // The remote never saw this entity; drop the whole history.
            (ChangeType::Created, ChangeType::Deleted) => {
                debug!(
                    "Coalescing CREATE+DELETE for {} into no-op",
                    record.entity_id
                );
                pending.remove(idx);
            }
            // Fold the diff into the queued snapshot, keep CREATE.
            (ChangeType::Created, ChangeType::Updated) => {
                let merged = merge_objects(pending[idx].data.take(), record.data);
                pending[idx].data = merged;
            }
            // Last UPDATE wins; DELETE collapses prior history.
            _ => {
                pending[idx] = record;
            }
        }
    }

    /// Atomically take all pending records for a sync pass. If the pass
    /// fails, undelivered records must be handed back via `restore`.
    pub async fn drain(&self) -> Vec<ChangeRecord> {
        let mut pending = self.pending.lock().await;
        let drained = std::mem::take(&mut *pending);
        if let Err(e) = self.persist(&pending).await {
            warn!("Failed to persist drained queue: {}", e);
        }
        drained
    }

    /// Return undelivered records to the queue. Records enqueued since the
    /// drain are newer and coalesce on top of the restored ones.
    pub async fn restore(&self, records: Vec<ChangeRecord>) {
        let mut pending = self.pending.lock().await;
        let newer = std::mem::take(&mut *pending);
        *pending = records;
        for record in newer {
            Self::coalesce(&mut pending, record);
        }
        if let Err(e) = self.persist(&pending).await {
            warn!("Failed to persist restored queue: {}", e);
        }
    }

    /// Pull a queued change back out (delete rollback path).
    pub async fn remove_entity(&self, entity_type: EntityType, entity_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.retain(|r| !(r.entity_type == entity_type && r.entity_id == entity_id));
        if let Err(e) = self.persist(&pending).await {
            warn!("Failed to persist queue after removal: {}", e);
        }
    }

    /// One-time migration: import pre-existing cached entries as synthetic
    /// CREATE records so history from the pre-queue store is not lost.
    /// Returns the number of records imported.
    pub async fn migrate_existing(&self, entries: &[LogEntry]) -> Result<usize> {
        if let Ok(Some(_)) = self.storage.get(MIGRATED_KEY).await {
            return Ok(0);
        }

        let mut imported = 0;
        {
            let mut pending = self.pending.lock().await;
            for entry in entries.iter().filter(|e| !e.is_deleted()) {
                let already_queued = pending.iter().any(|r| {
                    r.entity_type == EntityType::LogbookEntry && r.entity_id == entry.id
                });
                if already_queued {
                    continue;
                }
                let data = serde_json::to_value(entry)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                pending.push(ChangeRecord::created(
                    EntityType::LogbookEntry,
                    &entry.id,
                    data,
                ));
                imported += 1;
            }
            self.persist(&pending).await?;
        }

        self.storage
            .put(MIGRATED_KEY, &Utc::now().to_rfc3339())
            .await?;
        if imported > 0 {
            info!("Imported {} pre-existing entries into the change queue", imported);
        }
        Ok(imported)
    }

    async fn persist(&self, pending: &[ChangeRecord]) -> Result<()> {
        let json = serde_json::to_string(pending)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.put(PENDING_KEY, &json).await
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Vec<ChangeRecord> {
        self.pending.lock().await.clone()
    }
}

/// Shallow-merge two JSON objects, fields from `diff` winning.
fn merge_objects(
    base: Option<serde_json::Value>,
    diff: Option<serde_json::Value>,
) -> Option<serde_json::Value> {
    match (base, diff) {
        (Some(serde_json::Value::Object(mut base)), Some(serde_json::Value::Object(diff))) => {
            for (key, value) in diff {
                base.insert(key, value);
            }
            Some(serde_json::Value::Object(base))
        }
        (base, diff) => diff.or(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use serde_json::json;

    async fn queue() -> (Arc<InMemoryStorage>, ChangeQueue<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = ChangeQueue::load(Arc::clone(&storage)).await;
        (storage, queue)
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_reloads() {
        let (storage, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::created(
                EntityType::LogbookEntry,
                "e1",
                json!({"id": "e1"}),
            ))
            .await
            .unwrap();

        let reloaded = ChangeQueue::load(storage).await;
        assert_eq!(reloaded.len().await, 1);
    }

    #[tokio::test]
    async fn test_last_update_wins() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::updated(
                EntityType::LogbookEntry,
                "e1",
                json!({"duration": 30}),
            ))
            .await
            .unwrap();
        queue
            .enqueue(ChangeRecord::updated(
                EntityType::LogbookEntry,
                "e1",
                json!({"duration": 45}),
            ))
            .await
            .unwrap();

        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, Some(json!({"duration": 45})));
    }

    #[tokio::test]
    async fn test_delete_after_create_is_noop() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::created(
                EntityType::LogbookEntry,
                "e1",
                json!({"id": "e1"}),
            ))
            .await
            .unwrap();
        queue
            .enqueue(ChangeRecord::deleted(EntityType::LogbookEntry, "e1"))
            .await
            .unwrap();

        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_after_update_collapses_to_delete() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::updated(
                EntityType::LogbookEntry,
                "e1",
                json!({"duration": 45}),
            ))
            .await
            .unwrap();
        queue
            .enqueue(ChangeRecord::deleted(EntityType::LogbookEntry, "e1"))
            .await
            .unwrap();

        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change, ChangeType::Deleted);
        assert_eq!(pending[0].data, None);
    }

    #[tokio::test]
    async fn test_update_folds_into_queued_create() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::created(
                EntityType::LogbookEntry,
                "e1",
                json!({"id": "e1", "duration": 30}),
            ))
            .await
            .unwrap();
        queue
            .enqueue(ChangeRecord::updated(
                EntityType::LogbookEntry,
                "e1",
                json!({"duration": 45}),
            ))
            .await
            .unwrap();

        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change, ChangeType::Created);
        assert_eq!(pending[0].data, Some(json!({"id": "e1", "duration": 45})));
    }

    #[tokio::test]
    async fn test_same_id_different_entity_type_does_not_coalesce() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::updated(
                EntityType::LogbookEntry,
                "x",
                json!({"a": 1}),
            ))
            .await
            .unwrap();
        queue
            .enqueue(ChangeRecord::updated(EntityType::Goal, "x", json!({"b": 2})))
            .await
            .unwrap();

        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_drain_and_restore() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::created(
                EntityType::LogbookEntry,
                "e1",
                json!({"id": "e1"}),
            ))
            .await
            .unwrap();

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty().await);

        // Simulate a failed pass: records come back
        queue.restore(drained).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_restore_keeps_changes_enqueued_mid_pass() {
        let (_, queue) = queue().await;
        queue
            .enqueue(ChangeRecord::created(
                EntityType::LogbookEntry,
                "e1",
                json!({"id": "e1", "duration": 30}),
            ))
            .await
            .unwrap();

        let drained = queue.drain().await;

        // A mutation lands while the pass is in flight
        queue
            .enqueue(ChangeRecord::updated(
                EntityType::LogbookEntry,
                "e1",
                json!({"duration": 50}),
            ))
            .await
            .unwrap();

        queue.restore(drained).await;

        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        // CREATE restored first, mid-pass UPDATE folded into it
        assert_eq!(pending[0].change, ChangeType::Created);
        assert_eq!(
            pending[0].data,
            Some(json!({"id": "e1", "duration": 50}))
        );
    }

    #[tokio::test]
    async fn test_migration_runs_once() {
        use crate::entry::{EntryDraft, EntryType as Kind, Piece};
        use chrono::Utc;

        let (storage, queue) = queue().await;
        let mut draft = EntryDraft::new(20, Kind::Practice, "violin");
        draft.pieces = vec![Piece::new("Meditation", Some("Massenet"))];
        let entries = vec![draft.into_entry(Utc::now())];

        assert_eq!(queue.migrate_existing(&entries).await.unwrap(), 1);
        assert_eq!(queue.len().await, 1);

        // Second run is a no-op, marker is persisted
        assert_eq!(queue.migrate_existing(&entries).await.unwrap(), 0);

        let reloaded = ChangeQueue::load(storage).await;
        assert_eq!(reloaded.migrate_existing(&entries).await.unwrap(), 0);
    }
}
