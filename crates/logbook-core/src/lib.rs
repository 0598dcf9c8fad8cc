//! logbook-core: Shared Rust library for local-first practice-log sync.
//!
//! This crate provides the core functionality for:
//! - The entry and goal entity store with optimistic local mutations
//! - Persistent caching with immediate and debounced write policies
//! - Session and repertoire duplicate detection
//! - A durable change queue and the pull-merge-push sync engine
//! - CacheStorage and RemoteAuthority trait abstractions

pub mod cache;
pub mod dedup;
pub mod entry;
pub mod goal;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;
pub mod sync_engine;

pub use cache::CollectionCache;
pub use dedup::{Confidence, PieceMatch, RepertoireMatcher, ScoreInfo};
pub use entry::{EntryDraft, EntryPatch, EntryType, LogEntry, Mood, Piece, ValidationError};
pub use goal::{Goal, GoalDraft, GoalPatch, GoalStatus};
pub use queue::{ChangeQueue, ChangeRecord, ChangeType, EntityType};
pub use remote::{
    AuthState, InMemoryRemote, PushFailure, PushOutcome, RemoteAuthority, RemoteError, StaticAuth,
};
pub use storage::{CacheStorage, InMemoryStorage, StorageError};
pub use store::{CreateOutcome, LogbookStore, StoreError};
pub use sync::{SyncOutcome, SyncReport};
pub use sync_engine::SyncEngine;
