//! Pull-merge-push sync engine.
//!
//! One pass: drain the change queue, pull the remote view, merge
//! remote-wins-by-id (the remote is the durability authority once an id is
//! confirmed there), persist the merged view, then push the drained
//! changes. A pull failure aborts the pass and hands every drained record
//! back to the queue; a partial push failure hands back only the records
//! the server rejected.
//!
//! Passes are mutually exclusive. A trigger that arrives while a pass holds
//! the lock resolves to `AlreadyRunning` without any network I/O.

use crate::dedup;
use crate::entry::LogEntry;
use crate::goal::Goal;
use crate::queue::{ChangeRecord, ChangeType, EntityType};
use crate::remote::{AuthState, RemoteAuthority};
use crate::storage::CacheStorage;
use crate::store::LogbookStore;
use crate::sync::{SyncOutcome, SyncReport};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct SyncEngine<S: CacheStorage + 'static> {
    store: Arc<LogbookStore<S>>,
    remote: Arc<dyn RemoteAuthority>,
    auth: Arc<dyn AuthState>,
    // Held for the duration of a pass; try_lock implements single-flight.
    running: Mutex<()>,
}

impl<S: CacheStorage + 'static> SyncEngine<S> {
    pub fn new(
        store: Arc<LogbookStore<S>>,
        remote: Arc<dyn RemoteAuthority>,
        auth: Arc<dyn AuthState>,
    ) -> Self {
        Self {
            store,
            remote,
            auth,
            running: Mutex::new(()),
        }
    }

    /// Run one sync pass. Never panics the caller's task; every failure
    /// mode resolves to a typed outcome.
    pub async fn sync(&self) -> SyncOutcome {
        if !self.auth.is_authenticated() {
            debug!("Skipping sync pass: not authenticated");
            return SyncOutcome::NotAuthenticated;
        }

        let Ok(_guard) = self.running.try_lock() else {
            debug!("Sync pass already in flight");
            return SyncOutcome::AlreadyRunning;
        };

        let queue = self.store.queue();
        let drained = queue.drain().await;
        debug!("Starting sync pass with {} queued changes", drained.len());

        let mut report = SyncReport::default();

        // Pull is the gate for the whole pass: without the remote view we
        // cannot merge, so everything drained goes back.
        let remote_entries = match self.remote.pull().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Pull failed, aborting sync pass: {}", e);
                queue.restore(drained).await;
                self.store.set_advisory(format!("Sync failed: {}", e));
                report.error = Some(e.to_string());
                return SyncOutcome::Completed(report);
            }
        };

        let local = self.store.entries_snapshot();
        let basis: HashMap<String, LogEntry> =
            local.iter().map(|e| (e.id.clone(), e.clone())).collect();
        let (merged, skipped_ids) =
            self.merge_entries(local, remote_entries, &drained, &mut report);
        if let Err(e) = self.store.apply_merged_entries(merged, &basis).await {
            warn!("Failed to persist merged entries: {}", e);
            report.error = Some(e.to_string());
        }

        let mut failed_records = self
            .push_entries(&drained, &skipped_ids, &mut report)
            .await;

        failed_records.extend(self.sync_goals(&drained, &mut report).await);

        if !failed_records.is_empty() {
            queue.restore(failed_records).await;
        }

        if let Some(ref error) = report.error {
            self.store.set_advisory(format!("Sync incomplete: {}", error));
        } else {
            self.store.clear_advisory();
        }

        info!(
            "Sync pass done: {} pushed, {} applied, {} conflicts, {} duplicates skipped",
            report.changes_pushed,
            report.changes_applied,
            report.conflicts,
            report.duplicates_skipped
        );
        SyncOutcome::Completed(report)
    }

    /// Merge the remote view into the local one. Remote wins for any id
    /// present remotely whose local copy has no undelivered change; every
    /// such overwrite of a diverged local copy is counted as a conflict.
    ///
    /// Carve-outs:
    /// - ids with a drained CREATE/UPDATE are dirty: the queued local
    ///   change has not been delivered yet, so the local copy survives the
    ///   merge and goes out in the push step
    /// - ids with a drained DELETE stay deleted: the remote copy is not
    ///   reinstated, the tombstone is dropped, and the deletion goes out
    ///   through the direct endpoint in the push step
    /// - a locally queued CREATE whose content signature matches a remote
    ///   entry under a different id, or an earlier queued CREATE, is the
    ///   same session logged twice; one copy wins and the other is dropped
    ///   from both the merged view and the push set. Entries the user
    ///   created past a duplicate warning are exempt.
    fn merge_entries(
        &self,
        local: Vec<LogEntry>,
        remote_entries: Vec<LogEntry>,
        drained: &[ChangeRecord],
        report: &mut SyncReport,
    ) -> (Vec<LogEntry>, HashSet<String>) {
        let local_ids: HashSet<String> = local.iter().map(|e| e.id.clone()).collect();

        let remote_by_id: HashMap<&str, &LogEntry> =
            remote_entries.iter().map(|e| (e.id.as_str(), e)).collect();
        // Seeded with the remote set; surviving queued creates register
        // here so identical queued sessions collapse to one.
        let mut seen_signatures: HashSet<String> = remote_entries
            .iter()
            .filter(|e| !e.is_deleted())
            .map(dedup::content_signature)
            .collect();

        let pending_creates: HashSet<&str> = drained
            .iter()
            .filter(|r| {
                r.entity_type == EntityType::LogbookEntry && r.change == ChangeType::Created
            })
            .map(|r| r.entity_id.as_str())
            .collect();
        let pending_upserts: HashSet<&str> = drained
            .iter()
            .filter(|r| {
                r.entity_type == EntityType::LogbookEntry && r.change != ChangeType::Deleted
            })
            .map(|r| r.entity_id.as_str())
            .collect();
        let pending_deletes: HashSet<&str> = drained
            .iter()
            .filter(|r| {
                r.entity_type == EntityType::LogbookEntry && r.change == ChangeType::Deleted
            })
            .map(|r| r.entity_id.as_str())
            .collect();

        let mut merged: Vec<LogEntry> = Vec::with_capacity(local.len() + remote_entries.len());
        let mut skipped_ids: HashSet<String> = HashSet::new();

        for entry in local {
            if pending_deletes.contains(entry.id.as_str()) {
                continue;
            }
            if let Some(remote) = remote_by_id.get(entry.id.as_str()) {
                if **remote == entry || pending_upserts.contains(entry.id.as_str()) {
                    merged.push(entry);
                } else {
                    debug!("Conflict on {}: remote wins", entry.id);
                    report.conflicts += 1;
                    report.changes_applied += 1;
                    merged.push((*remote).clone());
                }
                continue;
            }

            let dedup_candidate = pending_creates.contains(entry.id.as_str())
                && !entry.is_deleted()
                && !entry.is_forced_duplicate();
            if dedup_candidate {
                let signature = dedup::content_signature(&entry);
                if seen_signatures.contains(&signature) {
                    debug!("Dropping {} in favor of a matching entry", entry.id);
                    report.duplicates_skipped += 1;
                    skipped_ids.insert(entry.id.clone());
                    continue;
                }
                seen_signatures.insert(signature);
            }
            // Local-only entries survive; they are either queued for push
            // or confirmed in an earlier pass.
            merged.push(entry);
        }

        for entry in remote_entries {
            let id = entry.id.as_str();
            if !local_ids.contains(id) && !pending_deletes.contains(id) && !entry.is_deleted() {
                report.changes_applied += 1;
                merged.push(entry);
            }
        }

        (merged, skipped_ids)
    }

    /// Push the drained entry changes. Returns the records the server did
    /// not accept, for restoration.
    async fn push_entries(
        &self,
        drained: &[ChangeRecord],
        skipped_ids: &HashSet<String>,
        report: &mut SyncReport,
    ) -> Vec<ChangeRecord> {
        let entry_records: Vec<&ChangeRecord> = drained
            .iter()
            .filter(|r| r.entity_type == EntityType::LogbookEntry)
            .filter(|r| !skipped_ids.contains(&r.entity_id))
            .collect();
        if entry_records.is_empty() {
            return Vec::new();
        }

        let current: HashMap<String, LogEntry> = self
            .store
            .entries_snapshot()
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        // Upserts carry the current merged snapshot; deletions go through
        // the direct endpoint since the merge already dropped the entity.
        let mut upserts: Vec<LogEntry> = Vec::new();
        let mut deletions: Vec<&ChangeRecord> = Vec::new();
        for record in &entry_records {
            match record.change {
                ChangeType::Created | ChangeType::Updated => {
                    match current.get(&record.entity_id) {
                        Some(entry) => upserts.push(entry.clone()),
                        // The entity was purged by an awaited delete while
                        // the pass ran; resubmitting the stale snapshot
                        // would resurrect it remotely.
                        None => debug!(
                            "Dropping queued change for deleted entity {}",
                            record.entity_id
                        ),
                    }
                }
                ChangeType::Deleted => deletions.push(*record),
            }
        }

        let mut failed: Vec<ChangeRecord> = Vec::new();

        if !upserts.is_empty() {
            match self.remote.push(upserts).await {
                Ok(outcome) => {
                    report.changes_pushed += outcome.accepted.len();
                    if outcome.is_partial() {
                        let failed_ids: HashSet<&str> = outcome
                            .failed
                            .iter()
                            .map(|f| f.entity_id.as_str())
                            .collect();
                        warn!("Push rejected {} of {} entries", failed_ids.len(),
                            failed_ids.len() + outcome.accepted.len());
                        failed.extend(
                            entry_records
                                .iter()
                                .filter(|r| failed_ids.contains(r.entity_id.as_str()))
                                .map(|r| (*r).clone()),
                        );
                        report.error = Some(format!(
                            "{} changes were rejected and will be retried",
                            failed_ids.len()
                        ));
                    }
                }
                Err(e) => {
                    warn!("Push failed: {}", e);
                    failed.extend(entry_records.iter().map(|r| (*r).clone()));
                    report.error = Some(e.to_string());
                    return failed;
                }
            }
        }

        for record in deletions {
            match self.remote.delete_entry(&record.entity_id).await {
                Ok(()) => report.changes_pushed += 1,
                Err(e) => {
                    warn!("Remote delete of {} failed: {}", record.entity_id, e);
                    failed.push((*record).clone());
                    report.error = Some(e.to_string());
                }
            }
        }

        failed
    }

    /// Pull-merge-push for goals, mirroring the entry pass. Goal trouble
    /// never aborts the entry work that already completed.
    async fn sync_goals(
        &self,
        drained: &[ChangeRecord],
        report: &mut SyncReport,
    ) -> Vec<ChangeRecord> {
        let goal_records: Vec<&ChangeRecord> = drained
            .iter()
            .filter(|r| r.entity_type == EntityType::Goal)
            .collect();

        let remote_goals = match self.remote.pull_goals().await {
            Ok(goals) => goals,
            Err(e) => {
                warn!("Goal pull failed: {}", e);
                report.error = Some(e.to_string());
                return goal_records.into_iter().cloned().collect();
            }
        };

        let local = self.store.goals_snapshot();
        let basis: HashMap<String, Goal> =
            local.iter().map(|g| (g.id.clone(), g.clone())).collect();
        let local_ids: HashSet<String> = local.iter().map(|g| g.id.clone()).collect();
        let remote_by_id: HashMap<&str, &Goal> =
            remote_goals.iter().map(|g| (g.id.as_str(), g)).collect();

        let mut merged: Vec<Goal> = Vec::with_capacity(local.len() + remote_goals.len());
        for goal in local {
            match remote_by_id.get(goal.id.as_str()) {
                Some(remote) if **remote != goal => {
                    report.conflicts += 1;
                    if remote.updated_at > goal.updated_at {
                        report.changes_applied += 1;
                        merged.push((*remote).clone());
                    } else {
                        merged.push(goal);
                    }
                }
                _ => merged.push(goal),
            }
        }
        for goal in remote_goals {
            if !local_ids.contains(goal.id.as_str()) {
                report.changes_applied += 1;
                merged.push(goal);
            }
        }

        if let Err(e) = self.store.apply_merged_goals(merged, &basis).await {
            warn!("Failed to persist merged goals: {}", e);
            report.error = Some(e.to_string());
        }

        if goal_records.is_empty() {
            return Vec::new();
        }

        let current: HashMap<String, Goal> = self
            .store
            .goals_snapshot()
            .into_iter()
            .map(|g| (g.id.clone(), g))
            .collect();
        let upserts: Vec<Goal> = goal_records
            .iter()
            .filter_map(|r| current.get(&r.entity_id).cloned())
            .collect();
        if upserts.is_empty() {
            return Vec::new();
        }

        match self.remote.push_goals(upserts).await {
            Ok(outcome) => {
                report.changes_pushed += outcome.accepted.len();
                if outcome.is_partial() {
                    let failed_ids: HashSet<&str> = outcome
                        .failed
                        .iter()
                        .map(|f| f.entity_id.as_str())
                        .collect();
                    report.error = Some(format!(
                        "{} goal changes were rejected and will be retried",
                        failed_ids.len()
                    ));
                    goal_records
                        .into_iter()
                        .filter(|r| failed_ids.contains(r.entity_id.as_str()))
                        .cloned()
                        .collect()
                } else {
                    Vec::new()
                }
            }
            Err(e) => {
                warn!("Goal push failed: {}", e);
                report.error = Some(e.to_string());
                goal_records.into_iter().cloned().collect()
            }
        }
    }
}
