//! File-backed remote authority.
//!
//! Treats a shared directory (network mount, synced folder) as the remote:
//! the entry and goal sets live in one JSON document each. Good enough for
//! a single household hub; an HTTP client would slot in behind the same
//! trait for a hosted server.

use async_trait::async_trait;
use logbook_core::entry::LogEntry;
use logbook_core::goal::Goal;
use logbook_core::remote::{PushOutcome, RemoteAuthority, RemoteError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

const ENTRIES_FILE: &str = "remote.entries.json";
const GOALS_FILE: &str = "remote.goals.json";

pub struct FileRemote {
    dir: PathBuf,
}

impl FileRemote {
    /// Point at a shared directory. Nothing is created until the first
    /// push; a missing directory reads as an empty remote.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load<T: DeserializeOwned>(&self, file: &str) -> Result<HashMap<String, T>> {
        let path = self.dir.join(file);
        match fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| RemoteError::Server(format!("corrupt {}: {}", file, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(RemoteError::Unavailable(e.to_string())),
        }
    }

    async fn save<T: Serialize>(&self, file: &str, values: &HashMap<String, T>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        let path = self.dir.join(file);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(values)
            .map_err(|e| RemoteError::Server(e.to_string()))?;

        fs::write(&tmp, &json)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        debug!("Wrote {} ({} bytes)", path.display(), json.len());
        Ok(())
    }
}

#[async_trait]
impl RemoteAuthority for FileRemote {
    async fn pull(&self) -> Result<Vec<LogEntry>> {
        let entries: HashMap<String, LogEntry> = self.load(ENTRIES_FILE).await?;
        Ok(entries.into_values().collect())
    }

    async fn push(&self, entries: Vec<LogEntry>) -> Result<PushOutcome> {
        let mut stored: HashMap<String, LogEntry> = self.load(ENTRIES_FILE).await?;
        let mut accepted = Vec::with_capacity(entries.len());
        for entry in entries {
            accepted.push(entry.id.clone());
            if entry.is_deleted() {
                stored.remove(&entry.id);
            } else {
                stored.insert(entry.id.clone(), entry);
            }
        }
        self.save(ENTRIES_FILE, &stored).await?;
        Ok(PushOutcome::all_accepted(accepted))
    }

    async fn pull_goals(&self) -> Result<Vec<Goal>> {
        let goals: HashMap<String, Goal> = self.load(GOALS_FILE).await?;
        Ok(goals.into_values().collect())
    }

    async fn push_goals(&self, goals: Vec<Goal>) -> Result<PushOutcome> {
        let mut stored: HashMap<String, Goal> = self.load(GOALS_FILE).await?;
        let mut accepted = Vec::with_capacity(goals.len());
        for goal in goals {
            accepted.push(goal.id.clone());
            stored.insert(goal.id.clone(), goal);
        }
        self.save(GOALS_FILE, &stored).await?;
        Ok(PushOutcome::all_accepted(accepted))
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        let mut stored: HashMap<String, LogEntry> = self.load(ENTRIES_FILE).await?;
        if stored.remove(id).is_some() {
            self.save(ENTRIES_FILE, &stored).await?;
        }
        Ok(())
    }

    async fn update_piece_name(&self, old_title: &str, new_title: &str) -> Result<()> {
        let mut stored: HashMap<String, LogEntry> = self.load(ENTRIES_FILE).await?;
        let mut changed = false;
        for entry in stored.values_mut() {
            for piece in &mut entry.pieces {
                if piece.title.eq_ignore_ascii_case(old_title) {
                    piece.title = new_title.to_string();
                    changed = true;
                }
            }
        }
        if changed {
            self.save(ENTRIES_FILE, &stored).await?;
        }
        Ok(())
    }
}
