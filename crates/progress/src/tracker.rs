//! Progress tracking service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use questline_core::{QuestFilter, QuestId, QuestStatus, UserId};
use questline_storage::{Result, Storage};
use tracing::debug;

use crate::calculator::{compute_progress, ProgressReport};

/// Progress lookups by quest id.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Progress of one quest, `None` if it does not exist for this user.
    async fn quest_progress(&self, owner: &UserId, id: QuestId) -> Result<Option<ProgressReport>>;

    /// Progress of every active quest of a user.
    async fn snapshot(&self, owner: &UserId) -> Result<ProgressSnapshot>;
}

/// A snapshot of progress at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// When snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Progress by quest ID
    pub quest_progress: Vec<(QuestId, ProgressReport)>,
}

/// Tracker reading quests straight from storage.
#[derive(Clone)]
pub struct StorageProgressTracker {
    storage: Arc<dyn Storage>,
}

impl StorageProgressTracker {
    /// Create a new progress tracker.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ProgressTracker for StorageProgressTracker {
    async fn quest_progress(&self, owner: &UserId, id: QuestId) -> Result<Option<ProgressReport>> {
        let quest = self.storage.load_quest(owner, id).await?;
        Ok(quest.as_ref().map(compute_progress))
    }

    async fn snapshot(&self, owner: &UserId) -> Result<ProgressSnapshot> {
        let quests = self
            .storage
            .list_quests(owner, &QuestFilter::with_status(QuestStatus::Active))
            .await?;
        debug!(user = %owner, quests = quests.len(), "progress snapshot");

        Ok(ProgressSnapshot {
            timestamp: Utc::now(),
            quest_progress: quests.iter().map(|q| (q.id, compute_progress(q))).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questline_core::{Quest, Rarity, Subtask, SubtaskKind, SubtaskSpec};
    use questline_storage::SqliteStorage;

    #[tokio::test]
    async fn test_progress_by_id() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let owner = UserId::new("alice");

        let mut quest = Quest::new(owner.clone(), "Q", Rarity::Common, 0, Utc::now());
        let mut done = Subtask::from_spec(quest.id, SubtaskSpec::checkbox("done", 1));
        done.kind = SubtaskKind::Checkbox { completed: true };
        quest.subtasks.push(done);
        quest.subtasks.push(Subtask::from_spec(quest.id, SubtaskSpec::checkbox("todo", 1)));
        storage.create_quest(&quest, &[]).await.unwrap();

        let tracker = StorageProgressTracker::new(storage);
        let report = tracker.quest_progress(&owner, quest.id).await.unwrap().unwrap();
        assert_eq!(report.percent, 50);

        let other = UserId::new("bob");
        assert!(tracker.quest_progress(&other, quest.id).await.unwrap().is_none());

        let snapshot = tracker.snapshot(&owner).await.unwrap();
        assert_eq!(snapshot.quest_progress, vec![(quest.id, report)]);
    }
}
