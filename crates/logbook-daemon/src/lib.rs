//! logbook-daemon: Headless practice-log sync daemon.
//!
//! Uses the same logbook-core as the app frontends, but runs as a native
//! binary with file-backed storage and a shared-directory remote.

pub mod remote;
pub mod scheduler;
pub mod storage;

pub use remote::FileRemote;
pub use scheduler::{SyncRequest, SyncRunner, SyncScheduler, SyncTrigger};
pub use storage::FileStorage;
