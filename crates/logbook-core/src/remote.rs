//! RemoteAuthority trait for the server boundary.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, with failure injection and call counters
//! - An HTTP client in the host application (out of scope here)
//!
//! The remote is the durability authority once it has confirmed an id; the
//! local side treats everything else as local-first state. `push` must be
//! idempotent by id: resubmitting an already-accepted id is a no-op.

use crate::entry::LogEntry;
use crate::goal::Goal;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Not authenticated")]
    Unauthorized,

    #[error("Request timed out")]
    Timeout,

    #[error("Server unavailable: {0}")]
    Unavailable(String),

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Per-entity result of a push. `failed` entries stay pending locally.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushOutcome {
    pub accepted: Vec<String>,
    pub failed: Vec<PushFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushFailure {
    pub entity_id: String,
    pub reason: String,
}

impl PushOutcome {
    pub fn all_accepted(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            accepted: ids.into_iter().collect(),
            failed: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// CRUD + push/pull boundary to the server.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// The server's current entry set for the authenticated principal.
    async fn pull(&self) -> Result<Vec<LogEntry>>;

    /// Submit local entries (tombstones included). Idempotent by id;
    /// per-entity failures are reported, not thrown.
    async fn push(&self, entries: Vec<LogEntry>) -> Result<PushOutcome>;

    async fn pull_goals(&self) -> Result<Vec<Goal>>;

    async fn push_goals(&self, goals: Vec<Goal>) -> Result<PushOutcome>;

    /// Direct deletion endpoint, awaited by the store's delete path.
    async fn delete_entry(&self, id: &str) -> Result<()>;

    /// Rename a piece across the principal's entries server-side.
    async fn update_piece_name(&self, old_title: &str, new_title: &str) -> Result<()>;
}

/// Gates whether background sync attempts occur at all. Unauthenticated
/// means local-only mode indefinitely, not an error.
pub trait AuthState: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

/// Fixed/toggleable auth state for wiring and tests.
pub struct StaticAuth {
    authenticated: AtomicBool,
}

impl StaticAuth {
    pub fn new(authenticated: bool) -> Arc<Self> {
        Arc::new(Self {
            authenticated: AtomicBool::new(authenticated),
        })
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthState for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

// ============================================================================
// In-memory remote for testing
// ============================================================================

/// In-memory remote authority with failure injection.
///
/// Counters track how many network round-trips actually happened, which is
/// what the mutual-exclusion and debounce tests assert on.
pub struct InMemoryRemote {
    entries: Mutex<HashMap<String, LogEntry>>,
    goals: Mutex<HashMap<String, Goal>>,
    fail_pull: AtomicBool,
    fail_push: AtomicBool,
    fail_delete: AtomicBool,
    /// Entity ids that fail individually on push (partial failure).
    fail_push_ids: Mutex<HashSet<String>>,
    pull_count: AtomicUsize,
    push_count: AtomicUsize,
    /// Artificial latency so tests can hold a pass in flight.
    latency: Mutex<Option<std::time::Duration>>,
}

impl InMemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            goals: Mutex::new(HashMap::new()),
            fail_pull: AtomicBool::new(false),
            fail_push: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_push_ids: Mutex::new(HashSet::new()),
            pull_count: AtomicUsize::new(0),
            push_count: AtomicUsize::new(0),
            latency: Mutex::new(None),
        })
    }

    pub fn set_fail_pull(&self, fail: bool) {
        self.fail_pull.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_push(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_push_for(&self, entity_id: &str) {
        self.fail_push_ids
            .lock()
            .unwrap()
            .insert(entity_id.to_string());
    }

    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn seed_entry(&self, entry: LogEntry) {
        self.entries.lock().unwrap().insert(entry.id.clone(), entry);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.push_count.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteAuthority for InMemoryRemote {
    async fn pull(&self) -> Result<Vec<LogEntry>> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("pull rejected".into()));
        }
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }

    async fn push(&self, entries: Vec<LogEntry>) -> Result<PushOutcome> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("push rejected".into()));
        }

        let failing = self.fail_push_ids.lock().unwrap().clone();
        let mut outcome = PushOutcome::default();
        let mut stored = self.entries.lock().unwrap();
        for entry in entries {
            if failing.contains(&entry.id) {
                outcome.failed.push(PushFailure {
                    entity_id: entry.id.clone(),
                    reason: "rejected by server".into(),
                });
                continue;
            }
            outcome.accepted.push(entry.id.clone());
            if entry.is_deleted() {
                stored.remove(&entry.id);
            } else {
                // Idempotent upsert by id
                stored.insert(entry.id.clone(), entry);
            }
        }
        Ok(outcome)
    }

    async fn pull_goals(&self) -> Result<Vec<Goal>> {
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("pull rejected".into()));
        }
        Ok(self.goals.lock().unwrap().values().cloned().collect())
    }

    async fn push_goals(&self, goals: Vec<Goal>) -> Result<PushOutcome> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("push rejected".into()));
        }
        let mut stored = self.goals.lock().unwrap();
        let mut accepted = Vec::new();
        for goal in goals {
            accepted.push(goal.id.clone());
            stored.insert(goal.id.clone(), goal);
        }
        Ok(PushOutcome::all_accepted(accepted))
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        self.simulate_latency().await;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("delete rejected".into()));
        }
        self.entries.lock().unwrap().remove(id);
        Ok(())
    }

    async fn update_piece_name(&self, _old_title: &str, _new_title: &str) -> Result<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("rename rejected".into()));
        }
        Ok(())
    }
}
