//! Questline core data models.
//!
//! This crate defines the quests, subtasks and recurrence templates that the
//! lifecycle and recurrence engines operate on.

// Core identities
mod id;
mod error;

// Quests and their parts
mod quest;
mod subtask;

// Recurrence
mod template;

// Re-exports
pub use id::*;
pub use error::ValidationError;

pub use quest::{
    is_planned_or_dismissed, scope, Quest, QuestFilter, QuestStatus, Rarity, SortKey, SortOrder,
    DEFAULT_AUTHOR,
    MAX_AUTHOR_LEN, MAX_DESCRIPTION_LEN, MAX_PARENTS, MAX_TITLE_LEN,
};
pub use subtask::{
    validate_current, validate_subtask_count, Subtask, SubtaskKind, SubtaskSpec, MAX_SUBTASKS,
    MAX_WEIGHT, MIN_WEIGHT,
};
pub use template::{QuestTemplate, RecurrenceType, TemplateSpec, DEFAULT_DURATION_HOURS};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
