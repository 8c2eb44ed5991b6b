//! Quest operations.

use std::sync::Arc;

use chrono::Duration;
use questline_core::{
    is_planned_or_dismissed, scope, validate_current, Quest, QuestFilter, QuestId, QuestStatus,
    SortKey, SortOrder, SubtaskId, SubtaskKind, Time, UserId,
};
use questline_execution::{QuestError, QuestLifecycle, RecurrenceEngine, Result, Transition};
use questline_progress::{
    ProgressReport, ProgressSnapshot, ProgressTracker, StorageProgressTracker,
};
use questline_storage::{Storage, StorageError};
use tracing::{debug, info};

use crate::spec::{QuestPatch, QuestSpec};

/// How far ahead `today_candidates` looks for deadlines.
const CANDIDATE_HORIZON_DAYS: i64 = 2;

/// User-scoped quest and template operations.
#[derive(Clone)]
pub struct QuestService {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) lifecycle: QuestLifecycle,
    pub(crate) recurrence: RecurrenceEngine,
    progress: StorageProgressTracker,
}

impl QuestService {
    /// Create a service over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            lifecycle: QuestLifecycle::new(storage.clone()),
            recurrence: RecurrenceEngine::new(storage.clone()),
            progress: StorageProgressTracker::new(storage.clone()),
            storage,
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // === Creation and lookup ===

    /// Create a quest, `inactive` if any parent is unfinished.
    pub async fn create_quest(&self, owner: &UserId, spec: QuestSpec, now: Time) -> Result<Quest> {
        let (quest, parents) = spec.into_quest(owner.clone(), now);
        self.lifecycle.create(quest, &parents).await
    }

    /// Load a quest.
    pub async fn get_quest(&self, owner: &UserId, id: QuestId) -> Result<Quest> {
        self.storage
            .load_quest(owner, id)
            .await?
            .ok_or_else(|| QuestError::quest_not_found(id))
    }

    /// Weighted progress of a quest.
    pub async fn get_progress(&self, owner: &UserId, id: QuestId) -> Result<ProgressReport> {
        self.progress
            .quest_progress(owner, id)
            .await?
            .ok_or_else(|| QuestError::quest_not_found(id))
    }

    /// Progress of every active quest.
    pub async fn progress_snapshot(&self, owner: &UserId) -> Result<ProgressSnapshot> {
        Ok(self.progress.snapshot(owner).await?)
    }

    /// Direct parents of a quest.
    pub async fn parents_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        self.lifecycle.graph().parents_of(owner, id).await
    }

    /// Direct children of a quest.
    pub async fn children_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        self.lifecycle.graph().children_of(owner, id).await
    }

    // === Transitions ===

    /// Finish a quest and credit its reward.
    pub async fn complete_quest(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        self.lifecycle.complete(owner, id).await
    }

    /// Fail a quest.
    pub async fn fail_quest(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        self.lifecycle.fail(owner, id).await
    }

    /// Put a finished or failed quest back to active.
    pub async fn revert_quest(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        self.lifecycle.revert(owner, id).await
    }

    /// Add parents to a quest.
    pub async fn attach_parents(
        &self,
        owner: &UserId,
        id: QuestId,
        parents: &[QuestId],
    ) -> Result<Quest> {
        self.lifecycle.attach_parents(owner, id, parents).await
    }

    /// Delete a quest with its subtasks and edges.
    ///
    /// Children it was blocking are activated if their remaining parents are
    /// all finished.
    pub async fn delete_quest(&self, owner: &UserId, id: QuestId) -> Result<()> {
        let children = self.lifecycle.graph().children_of(owner, id).await?;
        self.storage.delete_quest(owner, id).await?;
        info!(quest_id = %id, "quest deleted");

        for child in children {
            match self.lifecycle.activate(owner, child).await {
                Ok(_)
                | Err(QuestError::Blocked { .. })
                | Err(QuestError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // === Field edits ===

    /// Edit a quest's fields. Status is only changed through transitions.
    pub async fn update_quest(
        &self,
        owner: &UserId,
        id: QuestId,
        patch: QuestPatch,
    ) -> Result<Quest> {
        let mut quest = self.get_quest(owner, id).await?;
        patch.apply(&mut quest);
        quest.validate()?;
        quest.updated_at = chrono::Utc::now();
        Ok(self.storage.update_quest(&quest).await?)
    }

    /// Clear the unread flag.
    pub async fn mark_read(&self, owner: &UserId, id: QuestId) -> Result<Quest> {
        let mut quest = self.get_quest(owner, id).await?;
        if !quest.is_new {
            return Ok(quest);
        }
        quest.is_new = false;
        Ok(self.storage.update_quest(&quest).await?)
    }

    /// Set or clear the planning tag.
    pub async fn set_scope(
        &self,
        owner: &UserId,
        id: QuestId,
        scope: Option<String>,
    ) -> Result<Quest> {
        self.update_quest(
            owner,
            id,
            QuestPatch {
                scope: Some(scope),
                ..QuestPatch::default()
            },
        )
        .await
    }

    // === Listings ===

    /// Quests matching the filter, sorted as it requests.
    pub async fn list_quests(&self, owner: &UserId, filter: &QuestFilter) -> Result<Vec<Quest>> {
        let mut quests = self.storage.list_quests(owner, filter).await?;
        filter.sort(&mut quests);
        Ok(quests)
    }

    /// Active quests.
    pub async fn list_active(&self, owner: &UserId) -> Result<Vec<Quest>> {
        self.list_quests(owner, &QuestFilter::with_status(QuestStatus::Active))
            .await
    }

    /// Everything that is not active.
    pub async fn list_archived(&self, owner: &UserId) -> Result<Vec<Quest>> {
        self.list_quests(owner, &QuestFilter::archived()).await
    }

    /// Active quests pinned to today, nearest deadline first.
    pub async fn today_quests(&self, owner: &UserId) -> Result<Vec<Quest>> {
        let filter = QuestFilter {
            status: Some(vec![QuestStatus::Active]),
            scope: Some(scope::TODAY.to_string()),
            ..QuestFilter::default()
        }
        .sorted_by(SortKey::Deadline, SortOrder::Asc);
        self.list_quests(owner, &filter).await
    }

    /// Active quests due within two days that are neither planned for today
    /// nor dismissed for today.
    ///
    /// Expired quests of the user are failed first.
    pub async fn today_candidates(&self, owner: &UserId, now: Time) -> Result<Vec<Quest>> {
        for quest in self.list_active(owner).await? {
            if quest.is_expired(now) {
                match self.lifecycle.expire(quest, now).await {
                    Ok(_) | Err(QuestError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let today = now.date_naive();
        let horizon = now + Duration::days(CANDIDATE_HORIZON_DAYS);
        let mut candidates: Vec<Quest> = self
            .list_active(owner)
            .await?
            .into_iter()
            .filter(|q| !is_planned_or_dismissed(q.scope.as_deref(), today))
            .filter(|q| q.deadline.is_some_and(|d| d <= horizon))
            .collect();
        QuestFilter::default()
            .sorted_by(SortKey::Deadline, SortOrder::Asc)
            .sort(&mut candidates);
        Ok(candidates)
    }

    // === Subtasks ===

    /// Tick or untick a checkbox subtask. Returns the quest's new progress.
    pub async fn update_checkbox(
        &self,
        owner: &UserId,
        id: SubtaskId,
        completed: bool,
    ) -> Result<ProgressReport> {
        let mut subtask = self.load_subtask(owner, id).await?;
        match subtask.kind {
            SubtaskKind::Checkbox { .. } => subtask.kind = SubtaskKind::Checkbox { completed },
            SubtaskKind::Numeric { .. } => {
                return Err(QuestError::InvalidSubtask(format!(
                    "subtask {} is numeric, not a checkbox",
                    id
                )))
            }
        }
        self.storage.update_subtask(owner, &subtask).await?;
        debug!(subtask_id = %id, completed, "checkbox updated");
        self.get_progress(owner, subtask.quest_id).await
    }

    /// Set a numeric subtask's current value. Returns the quest's new progress.
    pub async fn update_numeric(
        &self,
        owner: &UserId,
        id: SubtaskId,
        current: f64,
    ) -> Result<ProgressReport> {
        validate_current(current)?;
        let mut subtask = self.load_subtask(owner, id).await?;
        match subtask.kind {
            SubtaskKind::Numeric { target, .. } => {
                subtask.kind = SubtaskKind::Numeric { target, current }
            }
            SubtaskKind::Checkbox { .. } => {
                return Err(QuestError::InvalidSubtask(format!(
                    "subtask {} is a checkbox, not numeric",
                    id
                )))
            }
        }
        self.storage.update_subtask(owner, &subtask).await?;
        debug!(subtask_id = %id, current, "numeric subtask updated");
        self.get_progress(owner, subtask.quest_id).await
    }

    async fn load_subtask(&self, owner: &UserId, id: SubtaskId) -> Result<questline_core::Subtask> {
        self.storage
            .load_subtask(owner, id)
            .await?
            .ok_or_else(|| StorageError::subtask_not_found(id).into())
    }

    // === Balance ===

    /// Reward balance of the user.
    pub async fn balance(&self, owner: &UserId) -> Result<i64> {
        Ok(self.storage.balance(owner).await?)
    }
}
