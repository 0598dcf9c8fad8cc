//! The logbook store: canonical local view of entries and goals.
//!
//! Mutations apply optimistically to the in-memory maps, persist through
//! the cache adapter, and append change records for the sync engine. The
//! store is an injectable service object: storage, remote, and auth are
//! constructor arguments, never ambient globals.
//!
//! Rollback policy per operation:
//! - create: rolled back if the durable cache write fails (losing the
//!   write would lose data); remote failures never roll it back
//! - update: never rolled back; remote trouble only sets the advisory
//! - delete: rolled back if awaited remote propagation fails; offline
//!   deletes stay queued as tombstones

use crate::cache::CollectionCache;
use crate::dedup::{self, PieceMatch, RepertoireMatcher, ScoreInfo};
use crate::entry::{EntryDraft, EntryPatch, FORCED_DUPLICATE_KEY, LogEntry, ValidationError};
use crate::goal::{Goal, GoalDraft, GoalPatch};
use crate::queue::{ChangeQueue, ChangeRecord, EntityType};
use crate::remote::{AuthState, RemoteAuthority, RemoteError};
use crate::storage::{CacheStorage, StorageError};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a background-sync advisory stays visible before auto-clearing.
const ADVISORY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of a create attempt. A detected duplicate is a user-decision
/// state (create anyway / reuse / edit), not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(String),
    DuplicateDetected { existing_id: String },
}

impl CreateOutcome {
    pub fn created_id(&self) -> Option<&str> {
        match self {
            CreateOutcome::Created(id) => Some(id),
            CreateOutcome::DuplicateDetected { .. } => None,
        }
    }
}

/// Named mutex registry: mutations serialize per logical operation name so
/// two concurrent `createEntry` calls cannot interleave their
/// map-insert-then-write sequence.
struct OpLocks {
    locks: Mutex<HashMap<&'static str, Arc<tokio::sync::Mutex<()>>>>,
}

impl OpLocks {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, name: &'static str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(name)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

struct Advisory {
    message: String,
    at: Instant,
}

/// True when an id has not been created, mutated, or deleted since a sync
/// pass snapshotted it.
fn untouched_since<T: PartialEq>(current: Option<&T>, basis: Option<&T>) -> bool {
    match (current, basis) {
        (Some(current), Some(basis)) => current == basis,
        (None, None) => true,
        _ => false,
    }
}

pub struct LogbookStore<S: CacheStorage + 'static> {
    entries: RwLock<HashMap<String, LogEntry>>,
    goals: RwLock<HashMap<String, Goal>>,
    scores: RwLock<Vec<ScoreInfo>>,
    cache: CollectionCache<S>,
    queue: Arc<ChangeQueue<S>>,
    remote: Arc<dyn RemoteAuthority>,
    auth: Arc<dyn AuthState>,
    locks: OpLocks,
    advisory: RwLock<Option<Advisory>>,
    matcher: RepertoireMatcher,
}

impl<S: CacheStorage + 'static> LogbookStore<S> {
    /// Load the store from durable state. Runs the one-time queue
    /// migration for entries cached by the pre-queue store.
    pub async fn open(
        storage: Arc<S>,
        remote: Arc<dyn RemoteAuthority>,
        auth: Arc<dyn AuthState>,
    ) -> Self {
        let cache = CollectionCache::new(Arc::clone(&storage));
        let queue = Arc::new(ChangeQueue::load(Arc::clone(&storage)).await);

        let entries: HashMap<String, LogEntry> = cache
            .load_entries()
            .await
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let goals: HashMap<String, Goal> = cache
            .load_goals()
            .await
            .into_iter()
            .map(|g| (g.id.clone(), g))
            .collect();
        let scores = cache.load_scores().await;

        let snapshot: Vec<LogEntry> = entries.values().cloned().collect();
        if let Err(e) = queue.migrate_existing(&snapshot).await {
            warn!("Change-queue migration failed: {}", e);
        }

        info!(
            "Store opened: {} entries, {} goals, {} queued changes",
            entries.len(),
            goals.len(),
            queue.len().await
        );

        Self {
            entries: RwLock::new(entries),
            goals: RwLock::new(goals),
            scores: RwLock::new(scores),
            cache,
            queue,
            remote,
            auth,
            locks: OpLocks::new(),
            advisory: RwLock::new(None),
            matcher: RepertoireMatcher::default(),
        }
    }

    /// The change queue, shared with the sync engine.
    pub fn queue(&self) -> Arc<ChangeQueue<S>> {
        Arc::clone(&self.queue)
    }

    pub fn cache(&self) -> &CollectionCache<S> {
        &self.cache
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Create an entry. Returns `DuplicateDetected` (without mutating
    /// anything) when an existing entry shares the content signature.
    pub async fn create_entry(&self, draft: EntryDraft) -> Result<CreateOutcome> {
        draft.validate()?;
        let _gate = self.locks.acquire("createEntry").await;

        let entry = draft.into_entry(Utc::now());

        if let Some(existing_id) = {
            let entries = self.entries.read().unwrap();
            dedup::find_session_duplicate(&entry, entries.values()).map(|e| e.id.clone())
        } {
            debug!(
                "Duplicate submission detected: {} matches {}",
                entry.id, existing_id
            );
            return Ok(CreateOutcome::DuplicateDetected { existing_id });
        }

        self.insert_entry(entry).await
    }

    /// Create the entry even though a duplicate was detected (explicit
    /// user confirmation path). The entry is marked so signature dedup at
    /// sync time honors the decision too.
    pub async fn create_entry_forced(&self, draft: EntryDraft) -> Result<CreateOutcome> {
        draft.validate()?;
        let _gate = self.locks.acquire("createEntry").await;
        let mut entry = draft.into_entry(Utc::now());
        entry.metadata.insert(
            FORCED_DUPLICATE_KEY.to_string(),
            serde_json::Value::Bool(true),
        );
        self.insert_entry(entry).await
    }

    async fn insert_entry(&self, entry: LogEntry) -> Result<CreateOutcome> {
        let id = entry.id.clone();

        let snapshot = {
            let mut entries = self.entries.write().unwrap();
            entries.insert(id.clone(), entry.clone());
            entries.values().cloned().collect::<Vec<_>>()
        };

        // Create is an immediate write; failure rolls the insert back.
        if let Err(e) = self.cache.save_entries_now(&snapshot).await {
            self.entries.write().unwrap().remove(&id);
            return Err(e.into());
        }

        let data = serde_json::to_value(&entry)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Err(e) = self
            .queue
            .enqueue(ChangeRecord::created(EntityType::LogbookEntry, &id, data))
            .await
        {
            // The record is held in memory; only its durability suffered.
            warn!("Failed to persist queued CREATE for {}: {}", id, e);
        }

        self.link_entry_to_goals(&entry).await;

        info!("Created entry {}", id);
        Ok(CreateOutcome::Created(id))
    }

    /// Merge a typed patch into an entry. Optimistic: the local update is
    /// never rolled back for downstream sync trouble.
    pub async fn update_entry(&self, id: &str, patch: EntryPatch) -> Result<()> {
        let _gate = self.locks.acquire("updateEntry").await;

        let diff = serde_json::to_value(&patch)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let snapshot = {
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .get_mut(id)
                .filter(|e| !e.is_deleted())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            patch.apply(entry, Utc::now())?;
            entries.values().cloned().collect::<Vec<_>>()
        };

        self.cache.save_entries_debounced(&snapshot).await;

        if let Err(e) = self
            .queue
            .enqueue(ChangeRecord::updated(EntityType::LogbookEntry, id, diff))
            .await
        {
            warn!("Failed to persist queued UPDATE for {}: {}", id, e);
        }

        Ok(())
    }

    /// Delete an entry. When authenticated, remote propagation is awaited
    /// and a failure restores the entry; offline, the tombstone stays
    /// queued for the next sync pass.
    pub async fn delete_entry(&self, id: &str) -> Result<()> {
        let _gate = self.locks.acquire("deleteEntry").await;

        let original = {
            let entries = self.entries.read().unwrap();
            entries
                .get(id)
                .filter(|e| !e.is_deleted())
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?
        };

        let now = Utc::now();
        let snapshot = {
            let mut entries = self.entries.write().unwrap();
            entries.insert(id.to_string(), original.clone().into_tombstone(now));
            entries.values().cloned().collect::<Vec<_>>()
        };
        self.cache.save_entries_now(&snapshot).await?;

        if !self.auth.is_authenticated() {
            if let Err(e) = self
                .queue
                .enqueue(ChangeRecord::deleted(EntityType::LogbookEntry, id))
                .await
            {
                warn!("Failed to persist queued DELETE for {}: {}", id, e);
            }
            info!("Deleted entry {} (offline, queued)", id);
            return Ok(());
        }

        match self.remote.delete_entry(id).await {
            Ok(()) => {
                let snapshot = {
                    let mut entries = self.entries.write().unwrap();
                    entries.remove(id);
                    entries.values().cloned().collect::<Vec<_>>()
                };
                if let Err(e) = self.cache.save_entries_now(&snapshot).await {
                    // Secondary write; the in-memory view already dropped it.
                    warn!("Failed to persist tombstone purge for {}: {}", id, e);
                }
                // Any queued CREATE/UPDATE for this entity is now moot.
                self.queue
                    .remove_entity(EntityType::LogbookEntry, id)
                    .await;
                info!("Deleted entry {}", id);
                Ok(())
            }
            Err(e) => {
                // Losing a restore would be worse than a duplicate delete
                // attempt, so delete is the one op that rolls back.
                let snapshot = {
                    let mut entries = self.entries.write().unwrap();
                    entries.insert(id.to_string(), original);
                    entries.values().cloned().collect::<Vec<_>>()
                };
                if let Err(persist_err) = self.cache.save_entries_now(&snapshot).await {
                    warn!("Failed to persist delete rollback for {}: {}", id, persist_err);
                }
                self.set_advisory(format!("Could not delete entry: {}", e));
                Err(e.into())
            }
        }
    }

    pub fn get_entry(&self, id: &str) -> Option<LogEntry> {
        self.entries
            .read()
            .unwrap()
            .get(id)
            .filter(|e| !e.is_deleted())
            .cloned()
    }

    /// Entries sorted by practice time, newest first. Tombstones excluded.
    pub fn list_entries(&self) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .entries
            .read()
            .unwrap()
            .values()
            .filter(|e| !e.is_deleted())
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    pub fn entry_count(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| !e.is_deleted())
            .count()
    }

    // ========================================================================
    // Goals
    // ========================================================================

    pub async fn create_goal(&self, draft: GoalDraft) -> Result<String> {
        let _gate = self.locks.acquire("createGoal").await;

        let goal = draft.into_goal(Utc::now());
        let id = goal.id.clone();

        let snapshot = {
            let mut goals = self.goals.write().unwrap();
            goals.insert(id.clone(), goal.clone());
            goals.values().cloned().collect::<Vec<_>>()
        };
        if let Err(e) = self.cache.save_goals_now(&snapshot).await {
            self.goals.write().unwrap().remove(&id);
            return Err(e.into());
        }

        let data = serde_json::to_value(&goal)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Err(e) = self
            .queue
            .enqueue(ChangeRecord::created(EntityType::Goal, &id, data))
            .await
        {
            warn!("Failed to persist queued CREATE for goal {}: {}", id, e);
        }

        info!("Created goal {}", id);
        Ok(id)
    }

    pub async fn update_goal(&self, id: &str, patch: GoalPatch) -> Result<()> {
        let _gate = self.locks.acquire("updateGoal").await;

        let diff = serde_json::to_value(&patch)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let snapshot = {
            let mut goals = self.goals.write().unwrap();
            let goal = goals
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            patch.apply(goal, Utc::now());
            goals.values().cloned().collect::<Vec<_>>()
        };

        self.cache.save_goals_debounced(&snapshot).await;

        if let Err(e) = self
            .queue
            .enqueue(ChangeRecord::updated(EntityType::Goal, id, diff))
            .await
        {
            warn!("Failed to persist queued UPDATE for goal {}: {}", id, e);
        }
        Ok(())
    }

    pub fn get_goal(&self, id: &str) -> Option<Goal> {
        self.goals.read().unwrap().get(id).cloned()
    }

    /// Goals sorted by creation time, newest first.
    pub fn list_goals(&self) -> Vec<Goal> {
        let mut goals: Vec<Goal> = self.goals.read().unwrap().values().cloned().collect();
        goals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        goals
    }

    /// Record the entry on every goal it references. Informational links;
    /// unknown goal ids are skipped.
    async fn link_entry_to_goals(&self, entry: &LogEntry) {
        if entry.goal_ids.is_empty() {
            return;
        }

        let now = Utc::now();
        let (snapshot, linked) = {
            let mut goals = self.goals.write().unwrap();
            let mut linked = Vec::new();
            for goal_id in &entry.goal_ids {
                if let Some(goal) = goals.get_mut(goal_id) {
                    if goal.link_entry(&entry.id, now) {
                        linked.push(goal_id.clone());
                    }
                }
            }
            (goals.values().cloned().collect::<Vec<_>>(), linked)
        };

        if linked.is_empty() {
            return;
        }

        self.cache.save_goals_debounced(&snapshot).await;
        for goal_id in linked {
            let diff = serde_json::json!({ "linkedEntries": { "added": entry.id } });
            if let Err(e) = self
                .queue
                .enqueue(ChangeRecord::updated(EntityType::Goal, &goal_id, diff))
                .await
            {
                warn!("Failed to persist queued link UPDATE for goal {}: {}", goal_id, e);
            }
        }
    }

    // ========================================================================
    // Repertoire
    // ========================================================================

    /// Suggest likely duplicates for a piece the user is about to add,
    /// ranked by similarity. Advisory only.
    pub fn suggest_piece_matches(&self, title: &str, composer: Option<&str>) -> Vec<PieceMatch> {
        let mut repertoire = {
            let entries = self.entries.read().unwrap();
            let snapshot: Vec<LogEntry> = entries.values().cloned().collect();
            dedup::repertoire_from_entries(&snapshot)
        };
        {
            let scores = self.scores.read().unwrap();
            for score in scores.iter() {
                let known = repertoire.iter().any(|p| {
                    dedup::canonical_score_id(&p.title, p.composer.as_deref())
                        == dedup::canonical_score_id(&score.title, score.composer.as_deref())
                });
                if !known {
                    repertoire.push(score.clone());
                }
            }
        }
        self.matcher.find_matches(title, composer, &repertoire)
    }

    /// Cache score metadata so the matcher sees pieces the user has not
    /// logged yet.
    pub async fn add_score(&self, score: ScoreInfo) -> Result<()> {
        let snapshot = {
            let mut scores = self.scores.write().unwrap();
            scores.push(score);
            scores.clone()
        };
        self.cache.save_scores(&snapshot).await?;
        Ok(())
    }

    /// Rename a piece across every entry that references it. Returns the
    /// number of entries touched.
    pub async fn rename_piece(&self, old_title: &str, new_title: &str) -> Result<usize> {
        let _gate = self.locks.acquire("renamePiece").await;

        let now = Utc::now();
        let (snapshot, touched) = {
            let mut entries = self.entries.write().unwrap();
            let mut touched = Vec::new();
            for entry in entries.values_mut().filter(|e| !e.is_deleted()) {
                let mut changed = false;
                for piece in &mut entry.pieces {
                    if piece.title.eq_ignore_ascii_case(old_title) {
                        piece.title = new_title.to_string();
                        changed = true;
                    }
                }
                if changed {
                    entry.updated_at = now;
                    touched.push((entry.id.clone(), entry.pieces.clone()));
                }
            }
            (entries.values().cloned().collect::<Vec<_>>(), touched)
        };

        if touched.is_empty() {
            return Ok(0);
        }

        self.cache.save_entries_debounced(&snapshot).await;

        for (id, pieces) in &touched {
            let diff = serde_json::json!({ "pieces": pieces });
            if let Err(e) = self
                .queue
                .enqueue(ChangeRecord::updated(EntityType::LogbookEntry, id, diff))
                .await
            {
                warn!("Failed to persist queued rename UPDATE for {}: {}", id, e);
            }
        }

        if self.auth.is_authenticated() {
            if let Err(e) = self.remote.update_piece_name(old_title, new_title).await {
                self.set_advisory(format!("Piece rename not yet synced: {}", e));
            }
        }

        info!(
            "Renamed piece '{}' -> '{}' in {} entries",
            old_title,
            new_title,
            touched.len()
        );
        Ok(touched.len())
    }

    // ========================================================================
    // Sync-engine access and advisory state
    // ========================================================================

    /// All entries including tombstones, for the sync engine.
    pub fn entries_snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    pub fn goals_snapshot(&self) -> Vec<Goal> {
        self.goals.read().unwrap().values().cloned().collect()
    }

    /// Fold the merged view from a sync pass into the entry map and
    /// persist it. `basis` is the snapshot the pass merged against: only
    /// ids the pass considered are touched, and an id created, mutated,
    /// or deleted since the snapshot keeps its current local state (the
    /// change queued for it goes out on the next pass).
    pub async fn apply_merged_entries(
        &self,
        merged: Vec<LogEntry>,
        basis: &HashMap<String, LogEntry>,
    ) -> Result<()> {
        let merged_by_id: HashMap<String, LogEntry> =
            merged.into_iter().map(|e| (e.id.clone(), e)).collect();
        let snapshot = {
            let mut entries = self.entries.write().unwrap();
            for (id, entry) in &merged_by_id {
                if untouched_since(entries.get(id), basis.get(id)) {
                    entries.insert(id.clone(), entry.clone());
                }
            }
            // Ids the merge dropped (purged tombstones, skipped duplicates)
            for id in basis.keys() {
                if !merged_by_id.contains_key(id)
                    && untouched_since(entries.get(id), basis.get(id))
                {
                    entries.remove(id);
                }
            }
            entries.values().cloned().collect::<Vec<_>>()
        };
        self.cache.save_entries_now(&snapshot).await?;
        Ok(())
    }

    pub async fn apply_merged_goals(
        &self,
        merged: Vec<Goal>,
        basis: &HashMap<String, Goal>,
    ) -> Result<()> {
        let merged_by_id: HashMap<String, Goal> =
            merged.into_iter().map(|g| (g.id.clone(), g)).collect();
        let snapshot = {
            let mut goals = self.goals.write().unwrap();
            for (id, goal) in &merged_by_id {
                if untouched_since(goals.get(id), basis.get(id)) {
                    goals.insert(id.clone(), goal.clone());
                }
            }
            for id in basis.keys() {
                if !merged_by_id.contains_key(id)
                    && untouched_since(goals.get(id), basis.get(id))
                {
                    goals.remove(id);
                }
            }
            goals.values().cloned().collect::<Vec<_>>()
        };
        self.cache.save_goals_now(&snapshot).await?;
        Ok(())
    }

    /// Set the shared advisory error surfaced to the UI.
    pub fn set_advisory(&self, message: String) {
        debug!("Advisory: {}", message);
        *self.advisory.write().unwrap() = Some(Advisory {
            message,
            at: Instant::now(),
        });
    }

    /// The current advisory, if it has not aged out.
    pub fn advisory(&self) -> Option<String> {
        let advisory = self.advisory.read().unwrap();
        advisory.as_ref().and_then(|a| {
            if a.at.elapsed() < ADVISORY_TTL {
                Some(a.message.clone())
            } else {
                None
            }
        })
    }

    pub fn clear_advisory(&self) {
        *self.advisory.write().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryType, Piece};
    use crate::queue::ChangeType;
    use crate::remote::{InMemoryRemote, StaticAuth};
    use crate::storage::InMemoryStorage;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        remote: Arc<InMemoryRemote>,
        store: LogbookStore<InMemoryStorage>,
    }

    async fn fixture(authenticated: bool) -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let remote = InMemoryRemote::new();
        let auth = StaticAuth::new(authenticated);
        let store = LogbookStore::open(
            Arc::clone(&storage),
            remote.clone() as Arc<dyn RemoteAuthority>,
            auth as Arc<dyn AuthState>,
        )
        .await;
        Fixture {
            storage,
            remote,
            store,
        }
    }

    fn draft() -> EntryDraft {
        let mut draft = EntryDraft::new(30, EntryType::Practice, "piano");
        draft.timestamp = Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap());
        draft.pieces = vec![Piece::new("Moonlight Sonata", Some("Beethoven"))];
        draft
    }

    #[tokio::test]
    async fn test_create_inserts_persists_and_queues() {
        let fx = fixture(true).await;

        let outcome = fx.store.create_entry(draft()).await.unwrap();
        let id = outcome.created_id().unwrap().to_string();

        assert_eq!(fx.store.entry_count(), 1);
        assert!(fx.store.get_entry(&id).is_some());

        // Durable immediately
        let cached = fx.store.cache().load_entries().await;
        assert_eq!(cached.len(), 1);

        // Queued for the next pass
        let pending = fx.store.queue().snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change, ChangeType::Created);
        assert_eq!(pending[0].entity_id, id);
    }

    #[tokio::test]
    async fn test_create_survives_remote_rejection() {
        // Local-first: push never happens during create, so a broken
        // remote cannot block the mutation.
        let fx = fixture(true).await;
        fx.remote.set_fail_push(true);
        fx.remote.set_fail_pull(true);

        let outcome = fx.store.create_entry(draft()).await.unwrap();
        assert!(outcome.created_id().is_some());
        assert_eq!(fx.store.entry_count(), 1);
        assert_eq!(fx.store.cache().load_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_cache_write_failure() {
        let fx = fixture(true).await;
        fx.storage.set_fail_writes(true);

        let result = fx.store.create_entry(draft()).await;
        assert!(matches!(result, Err(StoreError::Storage(_))));
        assert_eq!(fx.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_within_bucket_is_blocked() {
        let fx = fixture(true).await;

        let first = fx.store.create_entry(draft()).await.unwrap();
        let first_id = first.created_id().unwrap().to_string();

        // Identical content two minutes later, same 5-minute bucket
        let mut second = draft();
        second.timestamp =
            Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap() + chrono::Duration::minutes(2));

        let outcome = fx.store.create_entry(second).await.unwrap();
        assert_eq!(
            outcome,
            CreateOutcome::DuplicateDetected {
                existing_id: first_id
            }
        );
        assert_eq!(fx.store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_forced_create_bypasses_dedup() {
        let fx = fixture(true).await;
        fx.store.create_entry(draft()).await.unwrap();

        let outcome = fx.store.create_entry_forced(draft()).await.unwrap();
        assert!(outcome.created_id().is_some());
        assert_eq!(fx.store.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_six_minutes_apart_is_not_blocked() {
        let fx = fixture(true).await;
        fx.store.create_entry(draft()).await.unwrap();

        let mut second = draft();
        second.timestamp =
            Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap() + chrono::Duration::minutes(6));

        let outcome = fx.store.create_entry(second).await.unwrap();
        assert!(outcome.created_id().is_some());
        assert_eq!(fx.store.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_identical_creates_yield_one_entry() {
        let fx = fixture(true).await;
        let store = &fx.store;

        let (a, b) = tokio::join!(store.create_entry(draft()), store.create_entry(draft()));
        let outcomes = [a.unwrap(), b.unwrap()];

        let created = outcomes
            .iter()
            .filter(|o| o.created_id().is_some())
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_entry_is_not_found() {
        let fx = fixture(true).await;
        let result = fx
            .store
            .update_entry("missing", EntryPatch::default())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_is_optimistic_and_queues_diff() {
        let fx = fixture(true).await;
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        let patch = EntryPatch {
            duration: Some(55),
            ..Default::default()
        };
        fx.store.update_entry(&id, patch).await.unwrap();

        assert_eq!(fx.store.get_entry(&id).unwrap().duration, 55);

        // CREATE + UPDATE coalesced into one CREATE record
        let pending = fx.store.queue().snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change, ChangeType::Created);
    }

    #[tokio::test]
    async fn test_authenticated_delete_purges_locally_and_remotely() {
        let fx = fixture(true).await;
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        fx.store.delete_entry(&id).await.unwrap();

        assert!(fx.store.get_entry(&id).is_none());
        assert!(!fx.remote.contains(&id));
        // The queued CREATE became moot with the entity gone
        assert!(fx.store.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_rolls_back_when_remote_rejects() {
        let fx = fixture(true).await;
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();
        let count_before = fx.store.entry_count();

        fx.remote.set_fail_delete(true);
        let result = fx.store.delete_entry(&id).await;

        assert!(matches!(result, Err(StoreError::Remote(_))));
        assert_eq!(fx.store.entry_count(), count_before);
        assert!(fx.store.get_entry(&id).is_some());
        assert!(fx.store.advisory().is_some());
    }

    #[tokio::test]
    async fn test_offline_delete_queues_tombstone() {
        let fx = fixture(false).await;
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        fx.store.delete_entry(&id).await.unwrap();

        assert_eq!(fx.store.entry_count(), 0);
        assert!(fx.store.get_entry(&id).is_none());

        // CREATE followed by DELETE in the same cycle cancels out;
        // nothing to tell the remote about.
        assert!(fx.store.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_delete_of_synced_entry_stays_queued() {
        let fx = fixture(false).await;
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        // Simulate the CREATE having been delivered in an earlier pass
        fx.store.queue().drain().await;

        fx.store.delete_entry(&id).await.unwrap();

        let pending = fx.store.queue().snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change, ChangeType::Deleted);
    }

    #[tokio::test]
    async fn test_merge_application_keeps_entry_created_mid_pass() {
        let fx = fixture(true).await;

        // A pass snapshots the empty store; a create lands before the
        // merged view is applied
        let basis: HashMap<String, LogEntry> = HashMap::new();
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        let mut remote_draft = draft();
        remote_draft.timestamp = Some(Utc.timestamp_opt(1_600_000_000, 0).unwrap());
        let remote_entry = remote_draft.into_entry(Utc::now());
        let remote_id = remote_entry.id.clone();

        fx.store
            .apply_merged_entries(vec![remote_entry], &basis)
            .await
            .unwrap();

        assert!(fx.store.get_entry(&id).is_some());
        assert!(fx.store.get_entry(&remote_id).is_some());
        assert_eq!(fx.store.entry_count(), 2);
        // Still durable, queued for the next pass
        assert_eq!(fx.store.cache().load_entries().await.len(), 2);
        assert_eq!(fx.store.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_merge_application_keeps_entry_updated_mid_pass() {
        let fx = fixture(true).await;
        let id = fx
            .store
            .create_entry(draft())
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        let basis: HashMap<String, LogEntry> = fx
            .store
            .entries_snapshot()
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let stale = basis[&id].clone();

        // A local edit lands while the pass is in flight; the stale merge
        // result must not clobber it
        fx.store
            .update_entry(
                &id,
                EntryPatch {
                    duration: Some(60),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.store
            .apply_merged_entries(vec![stale], &basis)
            .await
            .unwrap();

        assert_eq!(fx.store.get_entry(&id).unwrap().duration, 60);
    }

    #[tokio::test]
    async fn test_entries_sorted_by_timestamp_desc() {
        let fx = fixture(true).await;

        let mut older = draft();
        older.timestamp = Some(Utc.timestamp_opt(1_600_000_000, 0).unwrap());
        older.pieces = vec![Piece::new("Old Piece", None)];
        fx.store.create_entry(older).await.unwrap();

        fx.store.create_entry(draft()).await.unwrap();

        let listed = fx.store.list_entries();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].timestamp > listed[1].timestamp);
    }

    #[tokio::test]
    async fn test_goal_linkage_on_entry_create() {
        let fx = fixture(true).await;
        let goal_id = fx
            .store
            .create_goal(GoalDraft::new("Finish the sonata"))
            .await
            .unwrap();

        let mut d = draft();
        d.goal_ids = vec![goal_id.clone()];
        let entry_id = fx
            .store
            .create_entry(d)
            .await
            .unwrap()
            .created_id()
            .unwrap()
            .to_string();

        let goal = fx.store.get_goal(&goal_id).unwrap();
        assert_eq!(goal.linked_entries, vec![entry_id]);
    }

    #[tokio::test]
    async fn test_rename_piece_touches_matching_entries() {
        let fx = fixture(false).await;
        fx.store.create_entry(draft()).await.unwrap();

        let mut other = draft();
        other.timestamp = Some(Utc.timestamp_opt(1_600_000_000, 0).unwrap());
        other.pieces = vec![Piece::new("moonlight sonata", Some("Beethoven"))];
        fx.store.create_entry(other).await.unwrap();

        let touched = fx
            .store
            .rename_piece("Moonlight Sonata", "Sonata No. 14")
            .await
            .unwrap();
        assert_eq!(touched, 2);

        for entry in fx.store.list_entries() {
            assert!(entry.pieces.iter().any(|p| p.title == "Sonata No. 14"));
        }
    }

    #[tokio::test]
    async fn test_piece_suggestions_come_from_log_and_score_cache() {
        let fx = fixture(true).await;
        fx.store.create_entry(draft()).await.unwrap();
        fx.store
            .add_score(ScoreInfo {
                score_id: Some("s1".into()),
                title: "Waldstein Sonata".into(),
                composer: Some("Beethoven".into()),
            })
            .await
            .unwrap();

        let matches = fx
            .store
            .suggest_piece_matches("Moonlight Sonata", Some("L. van Beethoven"));
        assert!(!matches.is_empty());
        assert_eq!(matches[0].piece.title, "Moonlight Sonata");
    }

    #[tokio::test]
    async fn test_advisory_clears_after_read_window() {
        let fx = fixture(true).await;
        fx.store.set_advisory("sync is taking longer than expected".into());
        assert!(fx.store.advisory().is_some());
        fx.store.clear_advisory();
        assert!(fx.store.advisory().is_none());
    }
}
