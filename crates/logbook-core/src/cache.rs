//! Persistent cache adapter for the entity collections.
//!
//! Sits between the in-memory store and a `CacheStorage` backend and owns
//! the two write policies:
//! - **immediate**: awaited write, used for create/delete where losing the
//!   write loses data
//! - **debounced**: coalesced write after a 500ms idle window, used for
//!   updates where only the latest merged state matters
//!
//! Reads never fail fatally: corrupt or missing documents load as empty
//! collections.

use crate::dedup::ScoreInfo;
use crate::entry::LogEntry;
use crate::goal::Goal;
use crate::storage::{CacheStorage, Result, StorageError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const ENTRIES_KEY: &str = "logbook.entries";
pub const GOALS_KEY: &str = "logbook.goals";
pub const SCORES_KEY: &str = "logbook.scores";

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Coalesces writes to one storage key: only the last snapshot scheduled
/// within the idle window is written.
struct DebouncedWriter<S: CacheStorage + 'static> {
    storage: Arc<S>,
    key: &'static str,
    window: Duration,
    pending: Arc<Mutex<Option<String>>>,
    generation: Arc<AtomicU64>,
}

impl<S: CacheStorage + 'static> DebouncedWriter<S> {
    fn new(storage: Arc<S>, key: &'static str, window: Duration) -> Self {
        Self {
            storage,
            key,
            window,
            pending: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the pending snapshot and (re)arm the flush timer. Earlier
    /// timers see a stale generation and exit without writing.
    async fn schedule(&self, json: String) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut pending = self.pending.lock().await;
            *pending = Some(json);
        }

        let storage = Arc::clone(&self.storage);
        let pending = Arc::clone(&self.pending);
        let gen_counter = Arc::clone(&self.generation);
        let key = self.key;
        let window = self.window;

        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if gen_counter.load(Ordering::SeqCst) != generation {
                // Superseded by a newer snapshot
                return;
            }
            let snapshot = {
                let mut pending = pending.lock().await;
                pending.take()
            };
            if let Some(json) = snapshot {
                if let Err(e) = storage.put(key, &json).await {
                    // Update writes favor availability of the in-memory
                    // state over durability.
                    warn!("Debounced write for '{}' failed: {}", key, e);
                } else {
                    debug!("Flushed debounced write for '{}'", key);
                }
            }
        });
    }

    /// Write any pending snapshot immediately and cancel the timer.
    async fn flush(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let snapshot = {
            let mut pending = self.pending.lock().await;
            pending.take()
        };
        if let Some(json) = snapshot {
            self.storage.put(self.key, &json).await?;
        }
        Ok(())
    }
}

/// Typed persistence for the entry, goal, and score-metadata collections.
pub struct CollectionCache<S: CacheStorage + 'static> {
    storage: Arc<S>,
    entry_writer: DebouncedWriter<S>,
    goal_writer: DebouncedWriter<S>,
}

impl<S: CacheStorage + 'static> CollectionCache<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            entry_writer: DebouncedWriter::new(Arc::clone(&storage), ENTRIES_KEY, DEBOUNCE_WINDOW),
            goal_writer: DebouncedWriter::new(Arc::clone(&storage), GOALS_KEY, DEBOUNCE_WINDOW),
            storage,
        }
    }

    fn serialize<T: Serialize>(key: &str, value: &T) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| StorageError::Serialization(format!("{}: {}", key, e)))
    }

    /// Load a collection; corrupt or missing data yields the empty
    /// collection rather than an error.
    async fn load<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        match self.storage.get(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Discarding corrupt cache document '{}': {}", key, e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read cache document '{}': {}", key, e);
                Vec::new()
            }
        }
    }

    pub async fn load_entries(&self) -> Vec<LogEntry> {
        self.load(ENTRIES_KEY).await
    }

    pub async fn load_goals(&self) -> Vec<Goal> {
        self.load(GOALS_KEY).await
    }

    pub async fn load_scores(&self) -> Vec<ScoreInfo> {
        self.load(SCORES_KEY).await
    }

    /// Immediate write of the entry collection. Errors propagate so the
    /// caller can roll back the mutation that required durability.
    pub async fn save_entries_now(&self, entries: &[LogEntry]) -> Result<()> {
        let json = Self::serialize(ENTRIES_KEY, &entries)?;
        self.storage.put(ENTRIES_KEY, &json).await
    }

    /// Debounced write of the entry collection (update path).
    pub async fn save_entries_debounced(&self, entries: &[LogEntry]) {
        match Self::serialize(ENTRIES_KEY, &entries) {
            Ok(json) => self.entry_writer.schedule(json).await,
            Err(e) => warn!("Skipping debounced entry write: {}", e),
        }
    }

    pub async fn save_goals_now(&self, goals: &[Goal]) -> Result<()> {
        let json = Self::serialize(GOALS_KEY, &goals)?;
        self.storage.put(GOALS_KEY, &json).await
    }

    pub async fn save_goals_debounced(&self, goals: &[Goal]) {
        match Self::serialize(GOALS_KEY, &goals) {
            Ok(json) => self.goal_writer.schedule(json).await,
            Err(e) => warn!("Skipping debounced goal write: {}", e),
        }
    }

    pub async fn save_scores(&self, scores: &[ScoreInfo]) -> Result<()> {
        let json = Self::serialize(SCORES_KEY, &scores)?;
        self.storage.put(SCORES_KEY, &json).await
    }

    /// Write all pending debounced snapshots now (shutdown path).
    pub async fn flush(&self) -> Result<()> {
        self.entry_writer.flush().await?;
        self.goal_writer.flush().await?;
        Ok(())
    }
}
