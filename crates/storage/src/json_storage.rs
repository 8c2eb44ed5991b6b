//! JSON file storage implementation.
//!
//! Document-style backend: every quest is one JSON document with its subtasks
//! embedded, parent links live in a small per-child document, and balances are
//! one counter document per user. There are no multi-document transactions;
//! writers serialize on a process-wide lock and files are replaced via
//! write-then-rename, which gives best-effort atomicity for single documents.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use questline_core::{
    Quest, QuestFilter, QuestId, QuestTemplate, Subtask, SubtaskId, TemplateId, Time, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::trait_::apply_delta;
use super::{Generation, Result, Storage, StorageError};

/// Parent links of one child quest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LinkDoc {
    owner: Option<UserId>,
    parents: BTreeSet<QuestId>,
}

/// Reward counter of one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BalanceDoc {
    balance: i64,
    updated_at: Option<Time>,
}

/// File-based JSON storage backend.
#[derive(Clone)]
pub struct JsonStorage {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonStorage {
    /// Create storage rooted at `root`, creating the collection directories.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("quests")).await?;
        fs::create_dir_all(root.join("links")).await?;
        fs::create_dir_all(root.join("templates")).await?;
        fs::create_dir_all(root.join("balances")).await?;

        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn quest_path(&self, id: QuestId) -> PathBuf {
        self.root.join("quests").join(format!("{}.json", id))
    }
    fn link_path(&self, id: QuestId) -> PathBuf {
        self.root.join("links").join(format!("{}.json", id))
    }
    fn template_path(&self, id: TemplateId) -> PathBuf {
        self.root.join("templates").join(format!("{}.json", id))
    }
    fn balance_path(&self, owner: &UserId) -> PathBuf {
        self.root
            .join("balances")
            .join(format!("{}.json", file_stem(owner)))
    }

    async fn owned_quest(&self, owner: &UserId, id: QuestId) -> Result<Option<Quest>> {
        let quest: Option<Quest> = read_json(&self.quest_path(id)).await?;
        Ok(quest.filter(|q| &q.owner == owner))
    }

    async fn owned_quests(&self, owner: &UserId) -> Result<Vec<Quest>> {
        let all: Vec<Quest> = list_dir(&self.root.join("quests")).await?;
        Ok(all.into_iter().filter(|q| &q.owner == owner).collect())
    }

    async fn require_quest(&self, owner: &UserId, id: QuestId) -> Result<Quest> {
        self.owned_quest(owner, id)
            .await?
            .ok_or_else(|| StorageError::quest_not_found(id))
    }

    async fn read_links(&self, id: QuestId) -> Result<LinkDoc> {
        Ok(read_json(&self.link_path(id)).await?.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl Storage for JsonStorage {
    async fn create_quest(&self, quest: &Quest, parents: &[QuestId]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        for parent in parents {
            self.require_quest(&quest.owner, *parent).await?;
        }

        write_json(&self.quest_path(quest.id), quest).await?;
        if !parents.is_empty() {
            let links = LinkDoc {
                owner: Some(quest.owner.clone()),
                parents: parents.iter().copied().collect(),
            };
            write_json(&self.link_path(quest.id), &links).await?;
        }

        debug!(quest_id = %quest.id, parents = parents.len(), "stored quest document");
        Ok(())
    }

    async fn load_quest(&self, owner: &UserId, id: QuestId) -> Result<Option<Quest>> {
        self.owned_quest(owner, id).await
    }

    async fn list_quests(&self, owner: &UserId, filter: &QuestFilter) -> Result<Vec<Quest>> {
        let mut quests: Vec<Quest> = self
            .owned_quests(owner)
            .await?
            .into_iter()
            .filter(|q| filter.matches(q))
            .collect();
        quests.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(quests)
    }

    async fn update_quest(&self, quest: &Quest) -> Result<Quest> {
        let _guard = self.write_lock.lock().await;

        let stored = self.require_quest(&quest.owner, quest.id).await?;
        if stored.version != quest.version {
            return Err(StorageError::Conflict {
                kind: "quest",
                id: quest.id.to_string(),
                expected: quest.version,
            });
        }

        let mut next = quest.clone();
        next.subtasks = stored.subtasks;
        next.version = stored.version + 1;
        write_json(&self.quest_path(next.id), &next).await?;
        Ok(next)
    }

    async fn delete_quest(&self, owner: &UserId, id: QuestId) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        self.require_quest(owner, id).await?;
        remove_if_exists(&self.quest_path(id)).await?;
        remove_if_exists(&self.link_path(id)).await?;

        // Drop this quest from every child's parent list.
        let mut rd = fs::read_dir(self.root.join("links")).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(mut links) = read_json::<LinkDoc>(&path).await? else {
                continue;
            };
            if links.parents.remove(&id) {
                if links.parents.is_empty() {
                    remove_if_exists(&path).await?;
                } else {
                    write_json(&path, &links).await?;
                }
            }
        }
        Ok(())
    }

    async fn list_expired_quests(&self, now: Time) -> Result<Vec<Quest>> {
        let all: Vec<Quest> = list_dir(&self.root.join("quests")).await?;
        Ok(all.into_iter().filter(|q| q.is_expired(now)).collect())
    }

    async fn add_parents(&self, owner: &UserId, child: QuestId, parents: &[QuestId]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        self.require_quest(owner, child).await?;
        for parent in parents {
            self.require_quest(owner, *parent).await?;
        }

        let mut links = self.read_links(child).await?;
        links.owner = Some(owner.clone());
        links.parents.extend(parents.iter().copied());
        write_json(&self.link_path(child), &links).await
    }

    async fn parents_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        let links = self.read_links(id).await?;
        if links.owner.as_ref().is_some_and(|o| o != owner) {
            return Ok(Vec::new());
        }
        Ok(links.parents.into_iter().collect())
    }

    async fn children_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        let mut children = Vec::new();
        let mut rd = fs::read_dir(self.root.join("links")).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            let Some(child) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<QuestId>().ok())
            else {
                continue;
            };
            let Some(links) = read_json::<LinkDoc>(&path).await? else {
                continue;
            };
            if links.owner.as_ref() == Some(owner) && links.parents.contains(&id) {
                children.push(child);
            }
        }
        children.sort();
        Ok(children)
    }

    async fn load_subtask(&self, owner: &UserId, id: SubtaskId) -> Result<Option<Subtask>> {
        Ok(self
            .owned_quests(owner)
            .await?
            .into_iter()
            .flat_map(|q| q.subtasks)
            .find(|s| s.id == id))
    }

    async fn update_subtask(&self, owner: &UserId, subtask: &Subtask) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut quest = self.require_quest(owner, subtask.quest_id).await?;
        let slot = quest
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask.id)
            .ok_or_else(|| StorageError::subtask_not_found(subtask.id))?;
        *slot = subtask.clone();
        write_json(&self.quest_path(quest.id), &quest).await
    }

    async fn save_template(&self, template: &QuestTemplate) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let path = self.template_path(template.id);
        let mut next = template.clone();
        if let Some(stored) = read_json::<QuestTemplate>(&path).await? {
            next.last_generated = stored.last_generated;
        }
        write_json(&path, &next).await
    }

    async fn load_template(&self, owner: &UserId, id: TemplateId) -> Result<Option<QuestTemplate>> {
        let template: Option<QuestTemplate> = read_json(&self.template_path(id)).await?;
        Ok(template.filter(|t| &t.owner == owner))
    }

    async fn list_templates(
        &self,
        owner: &UserId,
        active_only: bool,
    ) -> Result<Vec<QuestTemplate>> {
        let all: Vec<QuestTemplate> = list_dir(&self.root.join("templates")).await?;
        let mut templates: Vec<_> = all
            .into_iter()
            .filter(|t| &t.owner == owner && (!active_only || t.is_active))
            .collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(templates)
    }

    async fn list_active_templates(&self) -> Result<Vec<QuestTemplate>> {
        let all: Vec<QuestTemplate> = list_dir(&self.root.join("templates")).await?;
        Ok(all.into_iter().filter(|t| t.is_active).collect())
    }

    async fn delete_template(&self, owner: &UserId, id: TemplateId) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if self.load_template(owner, id).await?.is_none() {
            return Err(StorageError::template_not_found(id));
        }
        remove_if_exists(&self.template_path(id)).await
    }

    async fn record_generation(
        &self,
        template: &QuestTemplate,
        quest: &Quest,
        generated_at: Time,
    ) -> Result<Generation> {
        let _guard = self.write_lock.lock().await;

        let mut stored_template = self
            .load_template(&template.owner, template.id)
            .await?
            .ok_or_else(|| StorageError::template_not_found(template.id))?;

        let existing = match quest.generation_key.as_deref() {
            Some(key) => self
                .owned_quests(&quest.owner)
                .await?
                .into_iter()
                .find(|q| q.generation_key.as_deref() == Some(key)),
            None => None,
        };

        // Quest first, timestamp second: a crash in between leaves the key
        // behind, so the retry reuses this quest instead of duplicating it.
        let generated = match existing {
            Some(existing) => {
                debug!(quest_id = %existing.id, "generation key already used, reusing quest");
                Generation {
                    quest: existing,
                    inserted: false,
                }
            }
            None => {
                write_json(&self.quest_path(quest.id), quest).await?;
                Generation {
                    quest: quest.clone(),
                    inserted: true,
                }
            }
        };

        if stored_template
            .last_generated
            .map_or(true, |last| last < generated_at)
        {
            stored_template.last_generated = Some(generated_at);
            write_json(&self.template_path(stored_template.id), &stored_template).await?;
        }

        Ok(generated)
    }

    async fn add_reward(&self, owner: &UserId, delta: i64) -> Result<i64> {
        let _guard = self.write_lock.lock().await;

        let path = self.balance_path(owner);
        let mut doc: BalanceDoc = read_json(&path).await?.unwrap_or_default();
        doc.balance = apply_delta(owner, doc.balance, delta)?;
        doc.updated_at = Some(chrono::Utc::now());
        write_json(&path, &doc).await?;
        Ok(doc.balance)
    }

    async fn balance(&self, owner: &UserId) -> Result<i64> {
        let doc: Option<BalanceDoc> = read_json(&self.balance_path(owner)).await?;
        Ok(doc.map(|d| d.balance).unwrap_or(0))
    }
}

/// Map a user label onto a safe file name.
fn file_stem(owner: &UserId) -> String {
    let mut out = String::with_capacity(owner.as_str().len());
    for c in owner.as_str().chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else {
            for b in c.to_string().bytes() {
                out.push_str(&format!("%{:02x}", b));
            }
        }
    }
    out
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    fs::remove_file(path).await.or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(e)
        }
    })?;
    Ok(())
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Ok(Some(item)) = read_json(&entry.path()).await {
            items.push(item);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use questline_core::{
        QuestStatus, Rarity, RecurrenceType, SubtaskKind, SubtaskSpec, TemplateSpec,
    };

    fn now() -> Time {
        chrono::Utc::now()
    }

    async fn storage() -> (tempfile::TempDir, JsonStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_quest_roundtrip_with_subtasks() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let mut quest = Quest::new(owner.clone(), "Write report", Rarity::Rare, 30, now());
        quest.subtasks.push(Subtask::from_spec(quest.id, SubtaskSpec::checkbox("Outline", 2)));
        storage.create_quest(&quest, &[]).await.unwrap();

        let loaded = storage.load_quest(&owner, quest.id).await.unwrap().unwrap();
        assert_eq!(loaded, quest);
    }

    #[tokio::test]
    async fn test_quests_are_scoped_by_owner() {
        let (_dir, storage) = storage().await;
        let quest = Quest::new(UserId::new("alice"), "Mine", Rarity::Common, 0, now());
        storage.create_quest(&quest, &[]).await.unwrap();

        let bob = UserId::new("bob");
        assert!(storage.load_quest(&bob, quest.id).await.unwrap().is_none());
        assert!(storage.list_quests(&bob, &QuestFilter::default()).await.unwrap().is_empty());
        assert!(matches!(
            storage.delete_quest(&bob, quest.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_quest_checks_version() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let quest = Quest::new(owner.clone(), "Q", Rarity::Common, 0, now());
        storage.create_quest(&quest, &[]).await.unwrap();

        let mut first = quest.clone();
        first.status = QuestStatus::Finished;
        let stored = storage.update_quest(&first).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut stale = quest.clone();
        stale.status = QuestStatus::Failed;
        assert!(matches!(
            storage.update_quest(&stale).await,
            Err(StorageError::Conflict { .. })
        ));

        let loaded = storage.load_quest(&owner, quest.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QuestStatus::Finished);
    }

    #[tokio::test]
    async fn test_edges_and_delete_cleanup() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let parent = Quest::new(owner.clone(), "P", Rarity::Common, 0, now());
        let child = Quest::new(owner.clone(), "C", Rarity::Common, 0, now());
        storage.create_quest(&parent, &[]).await.unwrap();
        storage.create_quest(&child, &[parent.id]).await.unwrap();

        assert_eq!(storage.parents_of(&owner, child.id).await.unwrap(), vec![parent.id]);
        assert_eq!(storage.children_of(&owner, parent.id).await.unwrap(), vec![child.id]);

        storage.delete_quest(&owner, parent.id).await.unwrap();
        assert!(storage.parents_of(&owner, child.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_parent() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let child = Quest::new(owner.clone(), "C", Rarity::Common, 0, now());
        let result = storage.create_quest(&child, &[QuestId::new()]).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(storage.load_quest(&owner, child.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subtask_update() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let mut quest = Quest::new(owner.clone(), "Q", Rarity::Common, 0, now());
        let subtask = Subtask::from_spec(quest.id, SubtaskSpec::numeric("Pages", 1, 10.0));
        quest.subtasks.push(subtask.clone());
        storage.create_quest(&quest, &[]).await.unwrap();

        let mut changed = subtask.clone();
        changed.kind = SubtaskKind::Numeric {
            target: 10.0,
            current: 4.0,
        };
        storage.update_subtask(&owner, &changed).await.unwrap();

        let loaded = storage.load_subtask(&owner, subtask.id).await.unwrap().unwrap();
        assert_eq!(loaded, changed);
    }

    #[tokio::test]
    async fn test_balance_never_goes_negative() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        assert_eq!(storage.balance(&owner).await.unwrap(), 0);
        assert_eq!(storage.add_reward(&owner, 15).await.unwrap(), 15);
        assert!(matches!(
            storage.add_reward(&owner, -20).await,
            Err(StorageError::NegativeBalance { .. })
        ));
        assert_eq!(storage.balance(&owner).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_record_generation_is_idempotent_per_key() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let template = QuestTemplate::from_spec(
            owner.clone(),
            TemplateSpec::new("Stretch", RecurrenceType::Daily),
            now(),
        )
        .unwrap();
        storage.save_template(&template).await.unwrap();

        let at = now();
        let mut quest = Quest::new(owner.clone(), "Stretch", Rarity::Common, 0, at);
        quest.generation_key = Some(template.generation_key());
        let first = storage.record_generation(&template, &quest, at).await.unwrap();
        assert!(first.inserted);

        // Same key again, as if the caller retried with a stale template.
        let mut retry = quest.clone();
        retry.id = QuestId::new();
        let second = storage.record_generation(&template, &retry, at).await.unwrap();

        assert!(!second.inserted);
        assert_eq!(first.quest.id, second.quest.id);
        assert_eq!(storage.list_quests(&owner, &QuestFilter::default()).await.unwrap().len(), 1);
        let stored = storage.load_template(&owner, template.id).await.unwrap().unwrap();
        assert_eq!(stored.last_generated, Some(at));
    }

    #[tokio::test]
    async fn test_saving_stale_template_keeps_last_generated() {
        let (_dir, storage) = storage().await;
        let owner = UserId::new("alice");
        let template = QuestTemplate::from_spec(
            owner.clone(),
            TemplateSpec::new("Stretch", RecurrenceType::Daily),
            now(),
        )
        .unwrap();
        storage.save_template(&template).await.unwrap();

        // Snapshot taken before a generation commits.
        let mut snapshot = storage.load_template(&owner, template.id).await.unwrap().unwrap();
        let at = now();
        let mut quest = Quest::new(owner.clone(), "Stretch", Rarity::Common, 0, at);
        quest.generation_key = Some(template.generation_key());
        storage.record_generation(&template, &quest, at).await.unwrap();

        snapshot.title = "Stretch longer".to_string();
        storage.save_template(&snapshot).await.unwrap();

        let stored = storage.load_template(&owner, template.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Stretch longer");
        assert_eq!(stored.last_generated, Some(at));
    }

    #[test]
    fn test_file_stem_escapes_separators() {
        assert_eq!(file_stem(&UserId::new("a/b")), "a%2fb");
        assert_eq!(file_stem(&UserId::new("user_1")), "user_1");
    }
}
