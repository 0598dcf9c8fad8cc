//! CacheStorage trait abstraction for durable key-value persistence.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing, with write-failure injection
//! - `FileStorage` (in logbook-daemon) - One JSON document per key on disk
//!
//! The store and queue never touch a storage backend directly; they go
//! through `CollectionCache`, which owns the write policies.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Write failed for key '{0}': {1}")]
    WriteFailed(String, String),

    #[error("Read failed for key '{0}': {1}")]
    ReadFailed(String, String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable key-value persistence for entity collections.
///
/// Values are opaque JSON strings; callers own the schema per key. A
/// missing key reads as `None`, never an error.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Read the document stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Durably write `value` under `key`.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is a no-op.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory storage for testing.
///
/// `fail_writes` simulates a storage-quota or serialization failure so
/// rollback paths can be exercised.
pub struct InMemoryStorage {
    values: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `put` fail (quota-exceeded simulation).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a raw value, bypassing the failure flag.
    pub fn seed(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().unwrap().contains_key(key)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed(
                key.to_string(),
                "simulated quota exceeded".to_string(),
            ));
        }
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}

// Implement CacheStorage for Arc<T> where T: CacheStorage
// This allows sharing a backend between the cache and the change queue.
#[async_trait]
impl<T: CacheStorage> CacheStorage for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }
}
