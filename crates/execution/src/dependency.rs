//! Dependency graph between quests.
//!
//! Edges live in storage as parent/child id pairs. This layer only queries
//! and inserts edges; status changes that follow from them belong to the
//! lifecycle.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use questline_core::{QuestId, QuestStatus, UserId, ValidationError, MAX_PARENTS};
use questline_storage::Storage;
use tracing::debug;

use crate::error::{QuestError, Result};

/// Queries and edge insertion over the quest graph.
#[derive(Clone)]
pub struct DependencyGraph {
    storage: Arc<dyn Storage>,
}

impl DependencyGraph {
    /// Create a graph view over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Direct parents of a quest.
    pub async fn parents_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        Ok(self.storage.parents_of(owner, id).await?)
    }

    /// Direct children of a quest.
    pub async fn children_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        Ok(self.storage.children_of(owner, id).await?)
    }

    /// Parents of `id` that are not finished.
    pub async fn unfinished_parents(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        let mut unfinished = Vec::new();
        for parent in self.storage.parents_of(owner, id).await? {
            let finished = self
                .storage
                .load_quest(owner, parent)
                .await?
                .is_some_and(|q| q.status == QuestStatus::Finished);
            if !finished {
                unfinished.push(parent);
            }
        }
        Ok(unfinished)
    }

    /// True when the quest has no parents or every parent is finished.
    pub async fn is_unblocked(&self, owner: &UserId, id: QuestId) -> Result<bool> {
        Ok(self.unfinished_parents(owner, id).await?.is_empty())
    }

    /// Check a parent list for a quest that does not exist yet.
    ///
    /// Returns the de-duplicated list and whether every parent is finished.
    pub async fn check_new_parents(
        &self,
        owner: &UserId,
        parents: &[QuestId],
    ) -> Result<(Vec<QuestId>, bool)> {
        let parents = dedup(parents);
        check_count(parents.len())?;

        let mut all_finished = true;
        for parent in &parents {
            let quest = self
                .storage
                .load_quest(owner, *parent)
                .await?
                .ok_or_else(|| QuestError::quest_not_found(*parent))?;
            all_finished &= quest.status == QuestStatus::Finished;
        }
        Ok((parents, all_finished))
    }

    /// Add parents to an existing quest.
    ///
    /// Rejects unknown ids, more than the allowed number of parents in total,
    /// and any edge that would close a cycle. Returns the full parent list.
    pub async fn attach_parents(
        &self,
        owner: &UserId,
        child: QuestId,
        parents: &[QuestId],
    ) -> Result<Vec<QuestId>> {
        if self.storage.load_quest(owner, child).await?.is_none() {
            return Err(QuestError::quest_not_found(child));
        }

        let existing: BTreeSet<QuestId> = self
            .storage
            .parents_of(owner, child)
            .await?
            .into_iter()
            .collect();
        let new: Vec<QuestId> = dedup(parents)
            .into_iter()
            .filter(|p| !existing.contains(p))
            .collect();
        check_count(existing.len() + new.len())?;

        for parent in &new {
            if self.storage.load_quest(owner, *parent).await?.is_none() {
                return Err(QuestError::quest_not_found(*parent));
            }
            if self.is_ancestor(owner, child, *parent).await? {
                return Err(QuestError::CycleDetected {
                    child,
                    parent: *parent,
                });
            }
        }

        if !new.is_empty() {
            self.storage.add_parents(owner, child, &new).await?;
            debug!(quest_id = %child, added = new.len(), "attached parents");
        }

        Ok(existing.into_iter().chain(new).collect())
    }

    /// True if `ancestor` is reachable from `start` by following parent
    /// edges (or is `start` itself).
    ///
    /// Walks with an explicit stack so a corrupted graph cannot overflow.
    async fn is_ancestor(&self, owner: &UserId, ancestor: QuestId, start: QuestId) -> Result<bool> {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.storage.parents_of(owner, id).await?);
        }
        Ok(false)
    }
}

fn dedup(ids: &[QuestId]) -> Vec<QuestId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn check_count(count: usize) -> Result<()> {
    if count > MAX_PARENTS {
        return Err(ValidationError::TooManyParents {
            count,
            max: MAX_PARENTS,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{alice, insert, sqlite};
    use questline_core::QuestStatus;

    #[tokio::test]
    async fn test_unblocked_only_when_all_parents_finished() {
        let storage = sqlite().await;
        let graph = DependencyGraph::new(storage.clone());

        let a = insert(&storage, "A", QuestStatus::Finished, &[]).await;
        let b = insert(&storage, "B", QuestStatus::Active, &[]).await;
        let child = insert(&storage, "C", QuestStatus::Inactive, &[a.id, b.id]).await;

        assert!(!graph.is_unblocked(&alice(), child.id).await.unwrap());
        assert_eq!(graph.unfinished_parents(&alice(), child.id).await.unwrap(), vec![b.id]);
        assert!(graph.is_unblocked(&alice(), a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_rejects_more_than_ten_parents() {
        let storage = sqlite().await;
        let graph = DependencyGraph::new(storage.clone());
        let child = insert(&storage, "child", QuestStatus::Active, &[]).await;

        let mut parents = Vec::new();
        for i in 0..11 {
            parents.push(insert(&storage, &format!("p{}", i), QuestStatus::Active, &[]).await.id);
        }

        let err = graph.attach_parents(&alice(), child.id, &parents).await.unwrap_err();
        assert!(matches!(err, QuestError::TooManyParents { count: 11, max: 10 }));
        assert!(graph.parents_of(&alice(), child.id).await.unwrap().is_empty());

        let attached = graph.attach_parents(&alice(), child.id, &parents[..10]).await.unwrap();
        assert_eq!(attached.len(), 10);

        // Re-attaching an existing parent does not count twice.
        assert!(graph.attach_parents(&alice(), child.id, &parents[..1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_rejects_cycles() {
        let storage = sqlite().await;
        let graph = DependencyGraph::new(storage.clone());

        let a = insert(&storage, "A", QuestStatus::Active, &[]).await;
        let b = insert(&storage, "B", QuestStatus::Inactive, &[a.id]).await;
        let c = insert(&storage, "C", QuestStatus::Inactive, &[b.id]).await;

        let err = graph.attach_parents(&alice(), a.id, &[c.id]).await.unwrap_err();
        assert!(matches!(
            err,
            QuestError::CycleDetected { child, parent } if child == a.id && parent == c.id
        ));

        let err = graph.attach_parents(&alice(), a.id, &[a.id]).await.unwrap_err();
        assert!(matches!(err, QuestError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn test_attach_unknown_parent_is_not_found() {
        let storage = sqlite().await;
        let graph = DependencyGraph::new(storage.clone());
        let child = insert(&storage, "child", QuestStatus::Active, &[]).await;

        let err = graph.attach_parents(&alice(), child.id, &[QuestId::new()]).await.unwrap_err();
        assert!(matches!(err, QuestError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_check_new_parents_dedups() {
        let storage = sqlite().await;
        let graph = DependencyGraph::new(storage.clone());
        let p = insert(&storage, "P", QuestStatus::Finished, &[]).await;

        let (parents, all_finished) =
            graph.check_new_parents(&alice(), &[p.id, p.id]).await.unwrap();
        assert_eq!(parents, vec![p.id]);
        assert!(all_finished);
    }
}
