//! File-backed cache storage.
//!
//! Stores one JSON document per key as `<key>.json` inside the daemon's
//! data directory, so `logbook.entries` lands in `logbook.entries.json`.
//! Writes go through a temp file followed by a rename so a crash mid-write
//! never leaves a truncated document behind.

use async_trait::async_trait;
use logbook_core::storage::{CacheStorage, Result, StorageError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `data_dir`, creating the directory if needed.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            StorageError::WriteFailed(data_dir.display().to_string(), e.to_string())
        })?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are dotted identifiers; anything else is flattened so a key
        // can never escape the data directory.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.data_dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(key.to_string(), e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, value)
            .await
            .map_err(|e| StorageError::WriteFailed(key.to_string(), e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteFailed(key.to_string(), e.to_string()))?;

        debug!("Wrote {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::WriteFailed(key.to_string(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.get("logbook.entries").await.unwrap(), None);

        storage.put("logbook.entries", "[]").await.unwrap();
        assert_eq!(
            storage.get("logbook.entries").await.unwrap().as_deref(),
            Some("[]")
        );
        assert!(dir.path().join("logbook.entries.json").exists());

        storage.remove("logbook.entries").await.unwrap();
        assert_eq!(storage.get("logbook.entries").await.unwrap(), None);

        // Removing a missing key is fine
        storage.remove("logbook.entries").await.unwrap();
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.put("logbook.goals", "[{\"id\":\"g1\"}]").await.unwrap();
        }
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(
            storage.get("logbook.goals").await.unwrap().as_deref(),
            Some("[{\"id\":\"g1\"}]")
        );
    }

    #[tokio::test]
    async fn test_hostile_key_stays_inside_data_dir() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        storage.put("../escape", "x").await.unwrap();
        assert!(dir.path().join(".._escape.json").exists());
        assert_eq!(storage.get("../escape").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        storage.put("logbook.entries", "[]").await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
