//! Sync pass result types.
//!
//! A sync pass always resolves to a typed outcome; background passes are
//! never fire-and-forget.

use serde::Serialize;

/// Counters from one pull-merge-push cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Local changes delivered to the remote.
    pub changes_pushed: usize,
    /// Remote changes merged into the local view.
    pub changes_applied: usize,
    /// Entities where both sides had changed; resolved remote-wins-by-id.
    pub conflicts: usize,
    /// Local entries excluded from push by the content-signature check.
    pub duplicates_skipped: usize,
    /// Advisory error for a partial pass (push failures). `None` for a
    /// fully clean pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReport {
    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of requesting a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SyncOutcome {
    /// The pass ran to completion (possibly partial; see the report).
    Completed(SyncReport),
    /// Another pass held the lock; no network I/O was performed.
    AlreadyRunning,
    /// No bearer token; local-only mode, not an error.
    NotAuthenticated,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
