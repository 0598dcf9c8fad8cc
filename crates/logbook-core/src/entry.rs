//! Practice-log entry model.
//!
//! `LogEntry` is the canonical entity held by the store and exchanged with
//! the remote authority. Entries are created from an `EntryDraft` (validated
//! input) and partially updated through an `EntryPatch` (typed patch with
//! explicit optional fields).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Duration must be at least 1 minute, got {0}")]
    InvalidDuration(u32),

    #[error("At least one piece must have a non-empty title")]
    MissingPieceTitle,
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Kind of practice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Practice,
    Lesson,
    Performance,
    Rehearsal,
    Technique,
    StatusChange,
}

impl EntryType {
    /// Stable identifier used in content signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Practice => "practice",
            EntryType::Lesson => "lesson",
            EntryType::Performance => "performance",
            EntryType::Rehearsal => "rehearsal",
            EntryType::Technique => "technique",
            EntryType::StatusChange => "status_change",
        }
    }
}

/// How the session felt, if the user recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Frustrated,
    Neutral,
    Satisfied,
    Excited,
}

/// A piece worked on during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Piece {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_id: Option<String>,
}

impl Piece {
    pub fn new(title: impl Into<String>, composer: Option<&str>) -> Self {
        Self {
            title: title.into(),
            composer: composer.map(|c| c.to_string()),
            score_id: None,
        }
    }
}

/// A single practice session.
///
/// `id` is client-generated at creation time. `deleted_at` is the tombstone
/// marker used by the change queue; tombstoned entries are pushed to the
/// remote and filtered from all read views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Minutes, always >= 1.
    pub duration: u32,
    #[serde(rename = "type")]
    pub kind: EntryType,
    /// Normalized lowercase, free-form beyond the common set.
    pub instrument: String,
    #[serde(default)]
    pub pieces: Vec<Piece>,
    #[serde(default)]
    pub techniques: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<Mood>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub goal_ids: Vec<String>,
    /// Open bag for provenance (origin, auto-tracking source, etc.).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Metadata key marking an entry the user chose to keep despite a
/// duplicate warning. Sync-time signature dedup leaves such entries alone.
pub const FORCED_DUPLICATE_KEY: &str = "forcedDuplicate";

impl LogEntry {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_forced_duplicate(&self) -> bool {
        matches!(
            self.metadata.get(FORCED_DUPLICATE_KEY),
            Some(serde_json::Value::Bool(true))
        )
    }

    /// Reduce this entry to a tombstone for delta sync.
    pub fn into_tombstone(mut self, at: DateTime<Utc>) -> Self {
        self.deleted_at = Some(at);
        self.updated_at = at;
        self
    }
}

/// Validated input for creating an entry. The store assigns `id`,
/// `created_at` and `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct EntryDraft {
    pub timestamp: Option<DateTime<Utc>>,
    pub duration: u32,
    pub kind: Option<EntryType>,
    pub instrument: String,
    pub pieces: Vec<Piece>,
    pub techniques: Vec<String>,
    pub notes: Option<String>,
    pub mood: Option<Mood>,
    pub tags: Vec<String>,
    pub goal_ids: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EntryDraft {
    pub fn new(duration: u32, kind: EntryType, instrument: impl Into<String>) -> Self {
        Self {
            duration,
            kind: Some(kind),
            instrument: instrument.into(),
            ..Default::default()
        }
    }

    /// Check the invariants that must hold before any state mutation.
    pub fn validate(&self) -> Result<()> {
        if self.duration < 1 {
            return Err(ValidationError::InvalidDuration(self.duration));
        }
        if !self.pieces.is_empty() && self.pieces.iter().all(|p| p.title.trim().is_empty()) {
            return Err(ValidationError::MissingPieceTitle);
        }
        Ok(())
    }

    /// Materialize a full entry with a fresh client-generated id.
    pub fn into_entry(self, now: DateTime<Utc>) -> LogEntry {
        LogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: self.timestamp.unwrap_or(now),
            duration: self.duration,
            kind: self.kind.unwrap_or(EntryType::Practice),
            instrument: normalize_instrument(&self.instrument),
            pieces: self.pieces,
            techniques: dedup_tags(self.techniques),
            notes: normalize_notes(self.notes),
            mood: self.mood,
            tags: dedup_tags(self.tags),
            goal_ids: self.goal_ids,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Typed partial update. `None` means "leave unchanged"; for nullable
/// fields, `Some(None)` clears the value.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pieces: Option<Vec<Piece>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub techniques: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<Option<Mood>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl EntryPatch {
    /// Validate the patch against the entry it would produce, then merge
    /// it in and bump `updated_at`.
    pub fn apply(self, entry: &mut LogEntry, now: DateTime<Utc>) -> Result<()> {
        if let Some(duration) = self.duration {
            if duration < 1 {
                return Err(ValidationError::InvalidDuration(duration));
            }
        }
        if let Some(ref pieces) = self.pieces {
            if !pieces.is_empty() && pieces.iter().all(|p| p.title.trim().is_empty()) {
                return Err(ValidationError::MissingPieceTitle);
            }
        }

        if let Some(timestamp) = self.timestamp {
            entry.timestamp = timestamp;
        }
        if let Some(duration) = self.duration {
            entry.duration = duration;
        }
        if let Some(kind) = self.kind {
            entry.kind = kind;
        }
        if let Some(instrument) = self.instrument {
            entry.instrument = normalize_instrument(&instrument);
        }
        if let Some(pieces) = self.pieces {
            entry.pieces = pieces;
        }
        if let Some(techniques) = self.techniques {
            entry.techniques = dedup_tags(techniques);
        }
        if let Some(notes) = self.notes {
            entry.notes = normalize_notes(notes);
        }
        if let Some(mood) = self.mood {
            entry.mood = mood;
        }
        if let Some(tags) = self.tags {
            entry.tags = dedup_tags(tags);
        }
        if let Some(goal_ids) = self.goal_ids {
            entry.goal_ids = goal_ids;
        }
        if let Some(metadata) = self.metadata {
            entry.metadata = metadata;
        }

        entry.updated_at = now;
        Ok(())
    }
}

/// Instruments are stored normalized-lowercase so "Piano" and "piano"
/// compare equal in signatures and filters.
pub fn normalize_instrument(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Empty notes are normalized to `None` for storage compatibility.
fn normalize_notes(notes: Option<String>) -> Option<String> {
    notes.and_then(|n| {
        let trimmed = n.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Trim, drop empties, and de-duplicate while preserving order.
fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .filter_map(|t| {
            let trimmed = t.trim().to_string();
            if trimmed.is_empty() || !seen.insert(trimmed.to_lowercase()) {
                None
            } else {
                Some(trimmed)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> EntryDraft {
        let mut draft = EntryDraft::new(30, EntryType::Practice, "Piano");
        draft.pieces = vec![Piece::new("Moonlight Sonata", Some("Beethoven"))];
        draft
    }

    #[test]
    fn test_draft_validation_rejects_zero_duration() {
        let mut d = draft();
        d.duration = 0;
        assert_eq!(d.validate(), Err(ValidationError::InvalidDuration(0)));
    }

    #[test]
    fn test_draft_validation_requires_a_titled_piece() {
        let mut d = draft();
        d.pieces = vec![Piece::new("  ", None), Piece::new("", None)];
        assert_eq!(d.validate(), Err(ValidationError::MissingPieceTitle));

        // Empty list is fine (technique-only sessions)
        d.pieces = vec![];
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_into_entry_normalizes_fields() {
        let mut d = draft();
        d.instrument = "  Piano ".into();
        d.notes = Some("   ".into());
        d.tags = vec!["scales".into(), "Scales".into(), "".into(), "arpeggios".into()];

        let now = Utc::now();
        let entry = d.into_entry(now);

        assert_eq!(entry.instrument, "piano");
        assert_eq!(entry.notes, None);
        assert_eq!(entry.tags, vec!["scales", "arpeggios"]);
        assert_eq!(entry.created_at, now);
        assert_eq!(entry.updated_at, now);
        assert!(!entry.id.is_empty());
        assert!(entry.deleted_at.is_none());
    }

    #[test]
    fn test_patch_merges_and_bumps_updated_at() {
        let created = Utc::now();
        let mut entry = draft().into_entry(created);

        let later = created + chrono::Duration::minutes(10);
        let patch = EntryPatch {
            duration: Some(45),
            notes: Some(Some("worked on voicing".into())),
            ..Default::default()
        };
        patch.apply(&mut entry, later).unwrap();

        assert_eq!(entry.duration, 45);
        assert_eq!(entry.notes.as_deref(), Some("worked on voicing"));
        assert_eq!(entry.updated_at, later);
        assert_eq!(entry.created_at, created);
    }

    #[test]
    fn test_patch_can_clear_nullable_fields() {
        let mut entry = draft().into_entry(Utc::now());
        entry.notes = Some("old".into());
        entry.mood = Some(Mood::Satisfied);

        let patch = EntryPatch {
            notes: Some(None),
            mood: Some(None),
            ..Default::default()
        };
        patch.apply(&mut entry, Utc::now()).unwrap();

        assert_eq!(entry.notes, None);
        assert_eq!(entry.mood, None);
    }

    #[test]
    fn test_patch_rejects_invalid_duration_without_mutating() {
        let mut entry = draft().into_entry(Utc::now());
        let before = entry.clone();

        let patch = EntryPatch {
            duration: Some(0),
            notes: Some(Some("should not land".into())),
            ..Default::default()
        };
        assert!(patch.apply(&mut entry, Utc::now()).is_err());
        assert_eq!(entry, before);
    }

    #[test]
    fn test_entry_json_uses_storage_field_names() {
        let entry = draft().into_entry(Utc::now());
        let json = serde_json::to_string(&entry).unwrap();

        assert!(json.contains("\"type\":\"practice\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"goalIds\""));
    }

    #[test]
    fn test_tombstone_sets_deleted_and_updated() {
        let entry = draft().into_entry(Utc::now());
        let at = Utc::now() + chrono::Duration::seconds(5);
        let tomb = entry.into_tombstone(at);

        assert_eq!(tomb.deleted_at, Some(at));
        assert_eq!(tomb.updated_at, at);
        assert!(tomb.is_deleted());
    }
}
