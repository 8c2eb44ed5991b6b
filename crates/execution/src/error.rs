//! Errors raised by quest transitions, graph edits and generation.

use questline_core::{QuestId, QuestStatus, ValidationError};
use questline_storage::StorageError;

/// Result alias for the execution layer.
pub type Result<T> = std::result::Result<T, QuestError>;

/// Everything a quest operation can reject or fail with.
#[derive(Debug, thiserror::Error)]
pub enum QuestError {
    /// Unknown quest, template or subtask
    #[error("not found: {0}")]
    NotFound(String),

    /// More than the allowed number of parents
    #[error("too many parents: {count} (max {max})")]
    TooManyParents {
        /// Requested parent count
        count: usize,
        /// Allowed maximum
        max: usize,
    },

    /// More than the allowed number of subtasks
    #[error("too many subtasks: {count} (max {max})")]
    TooManySubtasks {
        /// Requested subtask count
        count: usize,
        /// Allowed maximum
        max: usize,
    },

    /// A subtask field is out of range
    #[error("invalid subtask: {0}")]
    InvalidSubtask(String),

    /// Recurrence settings incomplete for the chosen type
    #[error("invalid recurrence config: {0}")]
    InvalidRecurrenceConfig(String),

    /// The edge would make a quest depend on itself
    #[error("adding parent {parent} to {child} would create a cycle")]
    CycleDetected {
        /// Quest receiving the parent
        child: QuestId,
        /// Parent that closes the cycle
        parent: QuestId,
    },

    /// Activation requested while parents are unfinished
    #[error("quest {id} is blocked by {} unfinished parent(s)", .parents.len())]
    Blocked {
        /// Blocked quest
        id: QuestId,
        /// Parents that are not finished
        parents: Vec<QuestId>,
    },

    /// The state machine has no such edge
    #[error("cannot move quest {id} from {from} to {to}")]
    InvalidTransition {
        /// Quest
        id: QuestId,
        /// Current status
        from: QuestStatus,
        /// Requested status
        to: QuestStatus,
    },

    /// Any other field rejection
    #[error(transparent)]
    Validation(ValidationError),

    /// Another writer changed the quest first
    #[error("quest {0} was modified concurrently, reload and retry")]
    Conflict(String),

    /// Storage failure
    #[error(transparent)]
    Storage(StorageError),
}

impl QuestError {
    /// Shorthand for a missing quest.
    pub fn quest_not_found(id: QuestId) -> Self {
        QuestError::NotFound(format!("quest {}", id))
    }
}

impl From<ValidationError> for QuestError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::TooManyParents { count, max } => {
                QuestError::TooManyParents { count, max }
            }
            ValidationError::TooManySubtasks { count, max } => {
                QuestError::TooManySubtasks { count, max }
            }
            ValidationError::InvalidSubtask(msg) => QuestError::InvalidSubtask(msg),
            ValidationError::InvalidRecurrenceConfig(msg) => {
                QuestError::InvalidRecurrenceConfig(msg)
            }
            other => QuestError::Validation(other),
        }
    }
}

impl From<StorageError> for QuestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => QuestError::NotFound(what),
            StorageError::Conflict { id, .. } => QuestError::Conflict(id),
            other => QuestError::Storage(other),
        }
    }
}
