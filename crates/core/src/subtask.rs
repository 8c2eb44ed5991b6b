//! Subtasks - weighted sub-steps of a quest.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{QuestId, SubtaskId};

/// Maximum number of subtasks per quest.
pub const MAX_SUBTASKS: usize = 50;
/// Smallest allowed weight.
pub const MIN_WEIGHT: u32 = 1;
/// Largest allowed weight.
pub const MAX_WEIGHT: u32 = 100;
/// Maximum description length (characters).
pub const MAX_SUBTASK_DESCRIPTION_LEN: usize = 500;

/// A weighted sub-step of a quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier
    pub id: SubtaskId,

    /// Owning quest
    pub quest_id: QuestId,

    /// What needs doing
    pub description: String,

    /// Share of the quest's progress
    pub weight: u32,

    /// Checkbox or numeric progress
    #[serde(flatten)]
    pub kind: SubtaskKind,
}

/// The two subtask variants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubtaskKind {
    /// Done or not done
    Checkbox {
        /// Whether the box is ticked
        completed: bool,
    },
    /// Progress toward a numeric target
    Numeric {
        /// Goal value, > 0
        target: f64,
        /// Value reached so far, >= 0
        current: f64,
    },
}

impl SubtaskKind {
    /// Stored discriminant.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskKind::Checkbox { .. } => "checkbox",
            SubtaskKind::Numeric { .. } => "numeric",
        }
    }
}

/// Subtask data supplied at quest creation, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// What needs doing
    pub description: String,

    /// Share of the quest's progress
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Checkbox or numeric progress
    #[serde(flatten)]
    pub kind: SubtaskKind,
}

fn default_weight() -> u32 {
    MIN_WEIGHT
}

impl SubtaskSpec {
    /// An unticked checkbox.
    pub fn checkbox(description: impl Into<String>, weight: u32) -> Self {
        Self {
            description: description.into(),
            weight,
            kind: SubtaskKind::Checkbox { completed: false },
        }
    }

    /// A numeric subtask starting at zero.
    pub fn numeric(description: impl Into<String>, weight: u32, target: f64) -> Self {
        Self {
            description: description.into(),
            weight,
            kind: SubtaskKind::Numeric {
                target,
                current: 0.0,
            },
        }
    }
}

impl Subtask {
    /// Materialize a spec for the given quest.
    pub fn from_spec(quest_id: QuestId, spec: SubtaskSpec) -> Self {
        Self {
            id: SubtaskId::new(),
            quest_id,
            description: spec.description,
            weight: spec.weight,
            kind: spec.kind,
        }
    }

    /// Check weight, description and numeric bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let len = self.description.chars().count();
        if len == 0 || len > MAX_SUBTASK_DESCRIPTION_LEN {
            return Err(ValidationError::InvalidSubtask(format!(
                "description must be 1..={} characters",
                MAX_SUBTASK_DESCRIPTION_LEN
            )));
        }
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&self.weight) {
            return Err(ValidationError::InvalidSubtask(format!(
                "weight {} outside {}..={}",
                self.weight, MIN_WEIGHT, MAX_WEIGHT
            )));
        }
        if let SubtaskKind::Numeric { target, current } = self.kind {
            if !target.is_finite() || target <= 0.0 {
                return Err(ValidationError::InvalidSubtask(format!(
                    "target must be > 0, got {}",
                    target
                )));
            }
            validate_current(current)?;
        }
        Ok(())
    }
}

/// Numeric progress may never go below zero.
pub fn validate_current(current: f64) -> Result<(), ValidationError> {
    if !current.is_finite() || current < 0.0 {
        return Err(ValidationError::InvalidSubtask(format!(
            "current must be >= 0, got {}",
            current
        )));
    }
    Ok(())
}

/// Check the subtask count limit.
pub fn validate_subtask_count(count: usize) -> Result<(), ValidationError> {
    if count > MAX_SUBTASKS {
        return Err(ValidationError::TooManySubtasks {
            count,
            max: MAX_SUBTASKS,
        });
    }
    Ok(())
}
