//! Quest status state machine.
//!
//! ```text
//!              parents finished
//!   inactive ─────────────────▶ active ──complete──▶ finished
//!       ▲                         │  ▲                  │
//!       └──── parent reverted ────┘  └──── revert ──────┤
//!                                 └──────fail──▶ failed ┘
//! ```
//!
//! A revert lands on `inactive` instead while the quest's own parents are
//! not all finished.
//!
//! Every write is a version-checked update, so a user completing a quest and
//! the scheduler failing it for an expired deadline cannot both win. The
//! reward is credited only after the winning `finished` write.

use std::sync::Arc;

use questline_core::{
    validate_subtask_count, Quest, QuestId, QuestStatus, Time, UserId,
};
use questline_storage::Storage;
use tracing::{debug, info, warn};

use crate::dependency::DependencyGraph;
use crate::error::{QuestError, Result};

/// What a transition did.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The quest after the transition
    pub quest: Quest,

    /// False when the quest already was in the requested state
    pub changed: bool,

    /// Reward credited to the owner
    pub credited: u32,

    /// Children moved from inactive to active
    pub activated: Vec<QuestId>,

    /// Children moved from active back to inactive
    pub reblocked: Vec<QuestId>,
}

impl Transition {
    fn unchanged(quest: Quest) -> Self {
        Self {
            quest,
            changed: false,
            credited: 0,
            activated: Vec::new(),
            reblocked: Vec::new(),
        }
    }

    fn changed(quest: Quest) -> Self {
        Self {
            changed: true,
            ..Self::unchanged(quest)
        }
    }
}

/// Drives quest status transitions and their cascades.
#[derive(Clone)]
pub struct QuestLifecycle {
    storage: Arc<dyn Storage>,
    graph: DependencyGraph,
}

impl QuestLifecycle {
    /// Create a lifecycle over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let graph = DependencyGraph::new(storage.clone());
        Self { storage, graph }
    }

    /// The dependency graph this lifecycle cascades over.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Validate and persist a new quest with its parents.
    ///
    /// The initial status is `active` when every parent is finished (or there
    /// are none) and `inactive` otherwise. An `abstract` quest stays abstract.
    pub async fn create(&self, mut quest: Quest, parents: &[QuestId]) -> Result<Quest> {
        quest.validate()?;
        validate_subtask_count(quest.subtasks.len())?;
        for subtask in &quest.subtasks {
            subtask.validate()?;
        }

        let (parents, all_finished) = self.graph.check_new_parents(&quest.owner, parents).await?;
        if quest.status != QuestStatus::Abstract {
            quest.status = if all_finished {
                QuestStatus::Active
            } else {
                QuestStatus::Inactive
            };
        }

        self.storage.create_quest(&quest, &parents).await?;
        info!(
            quest_id = %quest.id,
            status = %quest.status,
            parents = parents.len(),
            subtasks = quest.subtasks.len(),
            "quest created"
        );
        Ok(quest)
    }

    /// Attach parents to an existing quest.
    ///
    /// An active quest that gains an unfinished parent becomes inactive.
    pub async fn attach_parents(
        &self,
        owner: &UserId,
        id: QuestId,
        parents: &[QuestId],
    ) -> Result<Quest> {
        self.graph.attach_parents(owner, id, parents).await?;

        let quest = self.load(owner, id).await?;
        if quest.status == QuestStatus::Active && !self.graph.is_unblocked(owner, id).await? {
            let quest = self.write_status(quest, QuestStatus::Inactive).await?;
            info!(quest_id = %id, "quest blocked by new parents");
            return Ok(quest);
        }
        Ok(quest)
    }

    /// Move an inactive quest to active once all its parents are finished.
    pub async fn activate(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        let quest = self.load(owner, id).await?;
        match quest.status {
            QuestStatus::Active => return Ok(Transition::unchanged(quest)),
            QuestStatus::Inactive => {}
            from => {
                return Err(QuestError::InvalidTransition {
                    id,
                    from,
                    to: QuestStatus::Active,
                })
            }
        }

        let unfinished = self.graph.unfinished_parents(owner, id).await?;
        if !unfinished.is_empty() {
            return Err(QuestError::Blocked {
                id,
                parents: unfinished,
            });
        }

        let quest = self.write_status(quest, QuestStatus::Active).await?;
        info!(quest_id = %id, "quest activated");
        Ok(Transition::changed(quest))
    }

    /// Finish a quest, credit its reward and release its children.
    ///
    /// Completing a finished quest is a no-op and credits nothing. A failed
    /// quest has to be reverted first.
    pub async fn complete(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        let quest = self.load(owner, id).await?;
        match quest.status {
            QuestStatus::Finished => return Ok(Transition::unchanged(quest)),
            QuestStatus::Failed => {
                return Err(QuestError::InvalidTransition {
                    id,
                    from: QuestStatus::Failed,
                    to: QuestStatus::Finished,
                })
            }
            _ => {}
        }

        let quest = self.write_status(quest, QuestStatus::Finished).await?;
        let mut transition = Transition::changed(quest);

        let cost = transition.quest.cost;
        if cost > 0 {
            let balance = self.storage.add_reward(owner, i64::from(cost)).await?;
            transition.credited = cost;
            debug!(user = %owner, cost, balance, "reward credited");
        }

        transition.activated = self.release_children(owner, id).await?;
        info!(
            quest_id = %id,
            credited = transition.credited,
            activated = transition.activated.len(),
            "quest completed"
        );
        Ok(transition)
    }

    /// Fail a quest. Failing an already failed quest is a no-op; a finished
    /// quest has to be reverted first.
    pub async fn fail(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        let quest = self.load(owner, id).await?;
        self.fail_quest(quest).await
    }

    /// Fail a quest whose deadline has passed.
    ///
    /// Works on the snapshot the caller read, so if the quest changed since
    /// (for example the user completed it) the write loses with
    /// [`QuestError::Conflict`]. Returns `None` if the snapshot is not expired.
    pub async fn expire(&self, quest: Quest, now: Time) -> Result<Option<Transition>> {
        if !quest.is_expired(now) {
            return Ok(None);
        }
        let id = quest.id;
        let transition = self.fail_quest(quest).await?;
        if transition.changed {
            info!(quest_id = %id, "quest failed: deadline passed");
        }
        Ok(Some(transition))
    }

    async fn fail_quest(&self, quest: Quest) -> Result<Transition> {
        let id = quest.id;
        match quest.status {
            QuestStatus::Failed => return Ok(Transition::unchanged(quest)),
            QuestStatus::Finished => {
                return Err(QuestError::InvalidTransition {
                    id,
                    from: QuestStatus::Finished,
                    to: QuestStatus::Failed,
                })
            }
            _ => {}
        }

        let owner = quest.owner.clone();
        let quest = self.write_status(quest, QuestStatus::Failed).await?;
        let mut transition = Transition::changed(quest);

        // A failed parent never counts as finished, so this only activates
        // children whose other parents changed underneath them.
        transition.activated = self.release_children(&owner, id).await?;
        info!(quest_id = %id, "quest failed");
        Ok(transition)
    }

    /// Put a finished or failed quest back to active, or to inactive when
    /// its own parents are not all finished.
    ///
    /// No reward is reclaimed. Children that were active only because this
    /// quest was finished go back to inactive.
    pub async fn revert(&self, owner: &UserId, id: QuestId) -> Result<Transition> {
        let quest = self.load(owner, id).await?;
        let was = quest.status;
        match was {
            QuestStatus::Active => return Ok(Transition::unchanged(quest)),
            QuestStatus::Finished | QuestStatus::Failed => {}
            from => {
                return Err(QuestError::InvalidTransition {
                    id,
                    from,
                    to: QuestStatus::Active,
                })
            }
        }

        let target = if self.graph.is_unblocked(owner, id).await? {
            QuestStatus::Active
        } else {
            QuestStatus::Inactive
        };
        let quest = self.write_status(quest, target).await?;
        let mut transition = Transition::changed(quest);
        if was == QuestStatus::Finished {
            transition.reblocked = self.reblock_children(owner, id).await?;
        }
        info!(
            quest_id = %id,
            from = %was,
            to = %target,
            reblocked = transition.reblocked.len(),
            "quest reverted"
        );
        Ok(transition)
    }

    /// One-hop cascade: activate inactive children whose parents are all
    /// finished now.
    async fn release_children(&self, owner: &UserId, parent: QuestId) -> Result<Vec<QuestId>> {
        let mut activated = Vec::new();
        for child_id in self.graph.children_of(owner, parent).await? {
            let Some(child) = self.storage.load_quest(owner, child_id).await? else {
                continue;
            };
            if child.status != QuestStatus::Inactive
                || !self.graph.is_unblocked(owner, child_id).await?
            {
                continue;
            }
            match self.write_status(child, QuestStatus::Active).await {
                Ok(_) => {
                    debug!(quest_id = %child_id, parent = %parent, "child activated");
                    activated.push(child_id);
                }
                Err(QuestError::Conflict(_)) => {
                    warn!(quest_id = %child_id, "child changed during cascade, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(activated)
    }

    /// Move active children that lost a finished parent back to inactive.
    async fn reblock_children(&self, owner: &UserId, parent: QuestId) -> Result<Vec<QuestId>> {
        let mut reblocked = Vec::new();
        for child_id in self.graph.children_of(owner, parent).await? {
            let Some(child) = self.storage.load_quest(owner, child_id).await? else {
                continue;
            };
            if child.status != QuestStatus::Active {
                continue;
            }
            match self.write_status(child, QuestStatus::Inactive).await {
                Ok(_) => reblocked.push(child_id),
                Err(QuestError::Conflict(_)) => {
                    warn!(quest_id = %child_id, "child changed during revert, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reblocked)
    }

    async fn load(&self, owner: &UserId, id: QuestId) -> Result<Quest> {
        self.storage
            .load_quest(owner, id)
            .await?
            .ok_or_else(|| QuestError::quest_not_found(id))
    }

    async fn write_status(&self, mut quest: Quest, status: QuestStatus) -> Result<Quest> {
        quest.status = status;
        quest.updated_at = chrono::Utc::now();
        Ok(self.storage.update_quest(&quest).await?)
    }
}
