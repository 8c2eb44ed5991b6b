//! Validation errors raised before anything is persisted.

/// A value was rejected by a model constraint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// More parents than a quest may depend on
    #[error("too many parents: {count} (max {max})")]
    TooManyParents {
        /// Requested parent count
        count: usize,
        /// Allowed maximum
        max: usize,
    },

    /// More subtasks than a quest may own
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

    /// Recurrence settings are incomplete for the chosen type
    #[error("invalid recurrence config: {0}")]
    InvalidRecurrenceConfig(String),

    /// A plain field is out of range
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// A stored label did not match any known variant
    #[error("unknown {kind} label: {value}")]
    UnknownLabel {
        /// Label family (status, rarity, ...)
        kind: &'static str,
        /// Offending value
        value: String,
    },
}
