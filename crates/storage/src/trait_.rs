//! Storage trait abstraction.

use async_trait::async_trait;
use questline_core::{
    Quest, QuestFilter, QuestId, QuestTemplate, Subtask, SubtaskId, TemplateId, Time, UserId,
};

/// Outcome of [`Storage::record_generation`].
#[derive(Debug, Clone)]
pub struct Generation {
    /// The stored quest for the generation slot
    pub quest: Quest,
    /// False when the generation key matched an existing quest
    pub inserted: bool,
}

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic version check failed
    #[error("version conflict on {kind} {id}: expected {expected}")]
    Conflict {
        /// Entity kind
        kind: &'static str,
        /// Entity id
        id: String,
        /// Version the writer expected to replace
        expected: u64,
    },

    /// A balance change would drop below zero
    #[error("balance of {user} would become negative ({balance} + {delta})")]
    NegativeBalance {
        /// Affected user
        user: UserId,
        /// Balance before the change
        balance: i64,
        /// Rejected delta
        delta: i64,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Shorthand for a missing quest.
    pub fn quest_not_found(id: QuestId) -> Self {
        StorageError::NotFound(format!("quest {}", id))
    }

    /// Shorthand for a missing template.
    pub fn template_not_found(id: TemplateId) -> Self {
        StorageError::NotFound(format!("template {}", id))
    }

    /// Shorthand for a missing subtask.
    pub fn subtask_not_found(id: SubtaskId) -> Self {
        StorageError::NotFound(format!("subtask {}", id))
    }
}

/// Storage abstraction for Questline data.
///
/// Every read and write is scoped to the owning user, except the sweep
/// queries (`list_expired_quests`, `list_active_templates`) used by the
/// scheduler, which span all users. Implementations must be shareable across
/// tasks, so all methods take `&self`.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Quest operations ===

    /// Insert a new quest with its subtasks and parent edges as one unit.
    async fn create_quest(&self, quest: &Quest, parents: &[QuestId]) -> Result<()>;

    /// Load a quest (with subtasks) by ID.
    async fn load_quest(&self, owner: &UserId, id: QuestId) -> Result<Option<Quest>>;

    /// List a user's quests matching the filter.
    async fn list_quests(&self, owner: &UserId, filter: &QuestFilter) -> Result<Vec<Quest>>;

    /// Write the quest's own fields if the stored version still equals
    /// `quest.version`. Returns the stored quest with its bumped version.
    ///
    /// Subtasks and edges are not touched.
    async fn update_quest(&self, quest: &Quest) -> Result<Quest>;

    /// Delete a quest together with its subtasks and every edge touching it.
    async fn delete_quest(&self, owner: &UserId, id: QuestId) -> Result<()>;

    /// Active quests of any user whose deadline is before `now`.
    async fn list_expired_quests(&self, now: Time) -> Result<Vec<Quest>>;

    // === Dependency edges ===

    /// Add parent -> child edges. Existing edges are left as they are.
    async fn add_parents(&self, owner: &UserId, child: QuestId, parents: &[QuestId]) -> Result<()>;

    /// Direct parents of a quest.
    async fn parents_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>>;

    /// Direct children of a quest.
    async fn children_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>>;

    // === Subtask operations ===

    /// Load a subtask by ID.
    async fn load_subtask(&self, owner: &UserId, id: SubtaskId) -> Result<Option<Subtask>>;

    /// Overwrite a subtask's mutable fields.
    async fn update_subtask(&self, owner: &UserId, subtask: &Subtask) -> Result<()>;

    // === Template operations ===

    /// Save a template (create or update).
    ///
    /// An existing template keeps its stored `last_generated`; only
    /// [`Storage::record_generation`] moves it.
    async fn save_template(&self, template: &QuestTemplate) -> Result<()>;

    /// Load a template by ID.
    async fn load_template(&self, owner: &UserId, id: TemplateId) -> Result<Option<QuestTemplate>>;

    /// List a user's templates.
    async fn list_templates(&self, owner: &UserId, active_only: bool) -> Result<Vec<QuestTemplate>>;

    /// Active templates of every user.
    async fn list_active_templates(&self) -> Result<Vec<QuestTemplate>>;

    /// Delete a template.
    async fn delete_template(&self, owner: &UserId, id: TemplateId) -> Result<()>;

    /// Persist a generated quest and advance the template's `last_generated`
    /// to `generated_at` (never backwards).
    ///
    /// If a quest with the same `generation_key` already exists for the
    /// owner, no new quest is inserted and the existing one is returned.
    async fn record_generation(
        &self,
        template: &QuestTemplate,
        quest: &Quest,
        generated_at: Time,
    ) -> Result<Generation>;

    // === Reward balance ===

    /// Atomically add `delta` to the user's balance and return the new value.
    ///
    /// Fails with [`StorageError::NegativeBalance`] if the result would be
    /// below zero. A user without a balance starts at zero.
    async fn add_reward(&self, owner: &UserId, delta: i64) -> Result<i64>;

    /// Current balance (zero if never credited).
    async fn balance(&self, owner: &UserId) -> Result<i64>;
}

/// Apply a balance delta, rejecting negative results.
pub(crate) fn apply_delta(owner: &UserId, balance: i64, delta: i64) -> Result<i64> {
    let next = balance.saturating_add(delta);
    if next < 0 {
        return Err(StorageError::NegativeBalance {
            user: owner.clone(),
            balance,
            delta,
        });
    }
    Ok(next)
}
