//! Practice goal model.
//!
//! Goals are user-defined targets linked to log entries. Linkage is
//! informational (no enforced referential integrity); progress moves when
//! entries reference a goal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    pub status: GoalStatus,
    /// 0-100, clamped on every mutation.
    pub progress: u8,
    #[serde(default)]
    pub linked_entries: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// Record that an entry references this goal. Idempotent per entry id.
    pub fn link_entry(&mut self, entry_id: &str, now: DateTime<Utc>) -> bool {
        if self.linked_entries.iter().any(|id| id == entry_id) {
            return false;
        }
        self.linked_entries.push(entry_id.to_string());
        self.updated_at = now;
        true
    }

    pub fn unlink_entry(&mut self, entry_id: &str, now: DateTime<Utc>) -> bool {
        let before = self.linked_entries.len();
        self.linked_entries.retain(|id| id != entry_id);
        if self.linked_entries.len() != before {
            self.updated_at = now;
            true
        } else {
            false
        }
    }
}

/// Input for creating a goal.
#[derive(Debug, Clone, Default)]
pub struct GoalDraft {
    pub title: String,
    pub description: Option<String>,
    pub target_date: Option<DateTime<Utc>>,
    pub instrument: Option<String>,
}

impl GoalDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn into_goal(self, now: DateTime<Utc>) -> Goal {
        Goal {
            id: Uuid::new_v4().to_string(),
            title: self.title,
            description: self.description,
            target_date: self.target_date,
            instrument: self.instrument.map(|i| crate::entry::normalize_instrument(&i)),
            status: GoalStatus::Active,
            progress: 0,
            linked_entries: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Typed partial update for goals.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_date: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<GoalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl GoalPatch {
    pub fn apply(self, goal: &mut Goal, now: DateTime<Utc>) {
        if let Some(title) = self.title {
            goal.title = title;
        }
        if let Some(description) = self.description {
            goal.description = description;
        }
        if let Some(target_date) = self.target_date {
            goal.target_date = target_date;
        }
        if let Some(instrument) = self.instrument {
            goal.instrument = instrument.map(|i| crate::entry::normalize_instrument(&i));
        }
        if let Some(status) = self.status {
            goal.status = status;
        }
        if let Some(progress) = self.progress {
            goal.progress = progress.min(100);
        }
        goal.updated_at = now;
    }
}
