//! SQLite storage backend for Questline.
//!
//! Relational layout: quests, subtasks, parent/child relationships, templates
//! and balances each get their own table. Multi-row writes (a quest with its
//! subtasks and edges, a generated quest with its template timestamp) run in
//! one transaction.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use questline_core::{
    Quest, QuestFilter, QuestId, QuestTemplate, RecurrenceType, Subtask, SubtaskId, SubtaskKind,
    TemplateId, Time, UserId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use super::trait_::apply_delta;
use super::trait_::{Generation, Result, Storage, StorageError};

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://quests.db`.
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// Every pooled connection to `:memory:` would get its own database, so
    /// the pool is pinned to a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS quests (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                description TEXT NOT NULL,
                rarity TEXT NOT NULL,
                cost INTEGER NOT NULL,
                deadline TEXT,
                created TEXT NOT NULL,
                status TEXT NOT NULL,
                scope TEXT,
                is_new INTEGER NOT NULL,
                template_id TEXT,
                generation_key TEXT,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_quests_owner ON quests(owner)",
            "CREATE INDEX IF NOT EXISTS idx_quests_status ON quests(status)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_quests_generation_key
                ON quests(owner, generation_key) WHERE generation_key IS NOT NULL",
            "CREATE TABLE IF NOT EXISTS subtasks (
                id TEXT PRIMARY KEY,
                quest_id TEXT NOT NULL REFERENCES quests(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                description TEXT NOT NULL,
                weight INTEGER NOT NULL,
                kind TEXT NOT NULL,
                completed INTEGER,
                target REAL,
                current REAL
            )",
            "CREATE INDEX IF NOT EXISTS idx_subtasks_quest ON subtasks(quest_id)",
            "CREATE TABLE IF NOT EXISTS quest_relationships (
                parent_id TEXT NOT NULL REFERENCES quests(id) ON DELETE CASCADE,
                child_id TEXT NOT NULL REFERENCES quests(id) ON DELETE CASCADE,
                owner TEXT NOT NULL,
                PRIMARY KEY (parent_id, child_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_relationships_child ON quest_relationships(child_id)",
            "CREATE TABLE IF NOT EXISTS quest_templates (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                description TEXT NOT NULL,
                cost INTEGER NOT NULL,
                rarity TEXT NOT NULL,
                scope TEXT,
                recurrence_type TEXT NOT NULL,
                duration_hours INTEGER NOT NULL,
                weekdays TEXT NOT NULL,
                interval_hours INTEGER,
                is_active INTEGER NOT NULL,
                start_at TEXT,
                end_at TEXT,
                last_generated TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_templates_owner ON quest_templates(owner)",
            "CREATE TABLE IF NOT EXISTS balances (
                owner TEXT PRIMARY KEY,
                balance INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        }

        Ok(())
    }

    async fn subtasks_for(&self, quest_id: QuestId) -> Result<Vec<Subtask>> {
        let rows = sqlx::query("SELECT * FROM subtasks WHERE quest_id = ? ORDER BY position")
            .bind(quest_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(subtask_from_row).collect()
    }

    async fn owned_ids_exist(&self, owner: &UserId, ids: &[QuestId]) -> Result<()> {
        for id in ids {
            let found = sqlx::query("SELECT 1 FROM quests WHERE id = ? AND owner = ?")
                .bind(id.to_string())
                .bind(owner.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
            if found.is_none() {
                return Err(StorageError::quest_not_found(*id));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    // === Quest operations ===

    async fn create_quest(&self, quest: &Quest, parents: &[QuestId]) -> Result<()> {
        self.owned_ids_exist(&quest.owner, parents).await?;

        let mut tx = self.pool.begin().await.map_err(db)?;
        insert_quest(&mut *tx, quest).await?;
        for parent in parents {
            sqlx::query(
                "INSERT OR IGNORE INTO quest_relationships (parent_id, child_id, owner)
                VALUES (?, ?, ?)",
            )
            .bind(parent.to_string())
            .bind(quest.id.to_string())
            .bind(quest.owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;

        debug!(quest_id = %quest.id, parents = parents.len(), "inserted quest row");
        Ok(())
    }

    async fn load_quest(&self, owner: &UserId, id: QuestId) -> Result<Option<Quest>> {
        let row = sqlx::query("SELECT * FROM quests WHERE id = ? AND owner = ?")
            .bind(id.to_string())
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;

        match row {
            Some(row) => {
                let mut quest = quest_from_row(&row)?;
                quest.subtasks = self.subtasks_for(quest.id).await?;
                Ok(Some(quest))
            }
            None => Ok(None),
        }
    }

    async fn list_quests(&self, owner: &UserId, filter: &QuestFilter) -> Result<Vec<Quest>> {
        let rows = sqlx::query("SELECT * FROM quests WHERE owner = ? ORDER BY created, id")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let mut quests = Vec::new();
        for row in &rows {
            let quest = quest_from_row(row)?;
            if filter.matches(&quest) {
                quests.push(quest);
            }
        }

        let subtask_rows = sqlx::query(
            "SELECT s.* FROM subtasks s JOIN quests q ON q.id = s.quest_id
            WHERE q.owner = ? ORDER BY s.quest_id, s.position",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        let mut by_quest: HashMap<QuestId, Vec<Subtask>> = HashMap::new();
        for row in &subtask_rows {
            let subtask = subtask_from_row(row)?;
            by_quest.entry(subtask.quest_id).or_default().push(subtask);
        }
        for quest in &mut quests {
            quest.subtasks = by_quest.remove(&quest.id).unwrap_or_default();
        }

        Ok(quests)
    }

    async fn update_quest(&self, quest: &Quest) -> Result<Quest> {
        let result = sqlx::query(
            "UPDATE quests SET title = ?, author = ?, description = ?, rarity = ?, cost = ?,
                deadline = ?, status = ?, scope = ?, is_new = ?, template_id = ?,
                generation_key = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND owner = ? AND version = ?",
        )
        .bind(&quest.title)
        .bind(&quest.author)
        .bind(&quest.description)
        .bind(quest.rarity.as_str())
        .bind(i64::from(quest.cost))
        .bind(quest.deadline)
        .bind(quest.status.as_str())
        .bind(quest.scope.as_deref())
        .bind(quest.is_new)
        .bind(quest.template_id.map(|id| id.to_string()))
        .bind(quest.generation_key.as_deref())
        .bind(quest.updated_at)
        .bind(quest.id.to_string())
        .bind(quest.owner.as_str())
        .bind(to_i64(quest.version)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM quests WHERE id = ? AND owner = ?")
                .bind(quest.id.to_string())
                .bind(quest.owner.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
            return Err(match exists {
                Some(_) => StorageError::Conflict {
                    kind: "quest",
                    id: quest.id.to_string(),
                    expected: quest.version,
                },
                None => StorageError::quest_not_found(quest.id),
            });
        }

        let mut next = quest.clone();
        next.version = quest.version + 1;
        next.subtasks = self.subtasks_for(quest.id).await?;
        Ok(next)
    }

    async fn delete_quest(&self, owner: &UserId, id: QuestId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query("DELETE FROM subtasks WHERE quest_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        sqlx::query(
            "DELETE FROM quest_relationships
            WHERE (parent_id = ? OR child_id = ?) AND owner = ?",
        )
        .bind(id.to_string())
        .bind(id.to_string())
        .bind(owner.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        let result = sqlx::query("DELETE FROM quests WHERE id = ? AND owner = ?")
            .bind(id.to_string())
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db)?;
            return Err(StorageError::quest_not_found(id));
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn list_expired_quests(&self, now: Time) -> Result<Vec<Quest>> {
        let rows = sqlx::query(
            "SELECT * FROM quests WHERE status = 'active' AND deadline IS NOT NULL
            ORDER BY deadline",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        // Sweep-wide reads skip rows that fail to decode instead of failing.
        let mut quests = Vec::with_capacity(rows.len());
        for row in &rows {
            match quest_from_row(row) {
                Ok(mut quest) if quest.is_expired(now) => {
                    quest.subtasks = self.subtasks_for(quest.id).await?;
                    quests.push(quest);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping undecodable quest row"),
            }
        }
        Ok(quests)
    }

    // === Dependency edges ===

    async fn add_parents(&self, owner: &UserId, child: QuestId, parents: &[QuestId]) -> Result<()> {
        self.owned_ids_exist(owner, &[child]).await?;
        self.owned_ids_exist(owner, parents).await?;

        let mut tx = self.pool.begin().await.map_err(db)?;
        for parent in parents {
            sqlx::query(
                "INSERT OR IGNORE INTO quest_relationships (parent_id, child_id, owner)
                VALUES (?, ?, ?)",
            )
            .bind(parent.to_string())
            .bind(child.to_string())
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn parents_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        let rows = sqlx::query(
            "SELECT parent_id FROM quest_relationships WHERE child_id = ? AND owner = ?
            ORDER BY parent_id",
        )
        .bind(id.to_string())
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(|row| parse_id(row, "parent_id")).collect()
    }

    async fn children_of(&self, owner: &UserId, id: QuestId) -> Result<Vec<QuestId>> {
        let rows = sqlx::query(
            "SELECT child_id FROM quest_relationships WHERE parent_id = ? AND owner = ?
            ORDER BY child_id",
        )
        .bind(id.to_string())
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(|row| parse_id(row, "child_id")).collect()
    }

    // === Subtask operations ===

    async fn load_subtask(&self, owner: &UserId, id: SubtaskId) -> Result<Option<Subtask>> {
        let row = sqlx::query(
            "SELECT s.* FROM subtasks s JOIN quests q ON q.id = s.quest_id
            WHERE s.id = ? AND q.owner = ?",
        )
        .bind(id.to_string())
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(subtask_from_row).transpose()
    }

    async fn update_subtask(&self, owner: &UserId, subtask: &Subtask) -> Result<()> {
        let (completed, target, current) = kind_columns(&subtask.kind);
        let result = sqlx::query(
            "UPDATE subtasks SET description = ?, weight = ?, kind = ?, completed = ?,
                target = ?, current = ?
            WHERE id = ? AND quest_id IN (SELECT id FROM quests WHERE id = ? AND owner = ?)",
        )
        .bind(&subtask.description)
        .bind(i64::from(subtask.weight))
        .bind(subtask.kind.as_str())
        .bind(completed)
        .bind(target)
        .bind(current)
        .bind(subtask.id.to_string())
        .bind(subtask.quest_id.to_string())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::subtask_not_found(subtask.id));
        }
        Ok(())
    }

    // === Template operations ===

    async fn save_template(&self, template: &QuestTemplate) -> Result<()> {
        let weekdays = serde_json::to_string(&template.weekdays)?;

        // last_generated is only written on insert; record_generation owns it.
        sqlx::query(
            "INSERT INTO quest_templates (id, owner, title, author, description, cost,
                rarity, scope, recurrence_type, duration_hours, weekdays, interval_hours,
                is_active, start_at, end_at, last_generated, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                description = excluded.description,
                cost = excluded.cost,
                rarity = excluded.rarity,
                scope = excluded.scope,
                recurrence_type = excluded.recurrence_type,
                duration_hours = excluded.duration_hours,
                weekdays = excluded.weekdays,
                interval_hours = excluded.interval_hours,
                is_active = excluded.is_active,
                start_at = excluded.start_at,
                end_at = excluded.end_at",
        )
        .bind(template.id.to_string())
        .bind(template.owner.as_str())
        .bind(&template.title)
        .bind(&template.author)
        .bind(&template.description)
        .bind(i64::from(template.cost))
        .bind(template.rarity.as_str())
        .bind(template.scope.as_deref())
        .bind(template.recurrence_type.as_str())
        .bind(i64::from(template.duration_hours))
        .bind(weekdays)
        .bind(template.interval_hours.map(i64::from))
        .bind(template.is_active)
        .bind(template.start_at)
        .bind(template.end_at)
        .bind(template.last_generated)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(())
    }

    async fn load_template(&self, owner: &UserId, id: TemplateId) -> Result<Option<QuestTemplate>> {
        let row = sqlx::query("SELECT * FROM quest_templates WHERE id = ? AND owner = ?")
            .bind(id.to_string())
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn list_templates(
        &self,
        owner: &UserId,
        active_only: bool,
    ) -> Result<Vec<QuestTemplate>> {
        let rows = sqlx::query(
            "SELECT * FROM quest_templates WHERE owner = ? AND (is_active = 1 OR ? = 0)
            ORDER BY created_at",
        )
        .bind(owner.as_str())
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(template_from_row).collect()
    }

    async fn list_active_templates(&self) -> Result<Vec<QuestTemplate>> {
        let rows = sqlx::query("SELECT * FROM quest_templates WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let mut templates = Vec::with_capacity(rows.len());
        for row in &rows {
            match template_from_row(row) {
                Ok(template) => templates.push(template),
                Err(e) => warn!(error = %e, "skipping undecodable template row"),
            }
        }
        Ok(templates)
    }

    async fn delete_template(&self, owner: &UserId, id: TemplateId) -> Result<()> {
        let result = sqlx::query("DELETE FROM quest_templates WHERE id = ? AND owner = ?")
            .bind(id.to_string())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::template_not_found(id));
        }
        Ok(())
    }

    async fn record_generation(
        &self,
        template: &QuestTemplate,
        quest: &Quest,
        generated_at: Time,
    ) -> Result<Generation> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query(
            "SELECT last_generated FROM quest_templates WHERE id = ? AND owner = ?",
        )
        .bind(template.id.to_string())
        .bind(template.owner.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .ok_or_else(|| StorageError::template_not_found(template.id))?;
        let last_generated: Option<Time> = row.try_get("last_generated").map_err(db)?;

        let existing: Option<QuestId> = match quest.generation_key.as_deref() {
            Some(key) => sqlx::query("SELECT id FROM quests WHERE owner = ? AND generation_key = ?")
                .bind(quest.owner.as_str())
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?
                .map(|row| parse_id(&row, "id"))
                .transpose()?,
            None => None,
        };

        if existing.is_none() {
            insert_quest(&mut *tx, quest).await?;
        }

        if last_generated.map_or(true, |last| last < generated_at) {
            sqlx::query("UPDATE quest_templates SET last_generated = ? WHERE id = ?")
                .bind(generated_at)
                .bind(template.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;

        match existing {
            Some(id) => {
                debug!(quest_id = %id, "generation key already used, reusing quest");
                let quest = self
                    .load_quest(&quest.owner, id)
                    .await?
                    .ok_or_else(|| StorageError::quest_not_found(id))?;
                Ok(Generation {
                    quest,
                    inserted: false,
                })
            }
            None => Ok(Generation {
                quest: quest.clone(),
                inserted: true,
            }),
        }
    }

    // === Reward balance ===

    async fn add_reward(&self, owner: &UserId, delta: i64) -> Result<i64> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            "INSERT INTO balances (owner, balance, updated_at) VALUES (?, 0, ?)
            ON CONFLICT(owner) DO NOTHING",
        )
        .bind(owner.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let result = sqlx::query(
            "UPDATE balances SET balance = balance + ?, updated_at = ?
            WHERE owner = ? AND balance + ? >= 0",
        )
        .bind(delta)
        .bind(now)
        .bind(owner.as_str())
        .bind(delta)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let balance: i64 = sqlx::query("SELECT balance FROM balances WHERE owner = ?")
            .bind(owner.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?
            .try_get("balance")
            .map_err(db)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db)?;
            // Produces the NegativeBalance error with the observed values.
            apply_delta(owner, balance, delta)?;
            return Err(StorageError::Other(format!(
                "balance update for {} was not applied",
                owner
            )));
        }

        tx.commit().await.map_err(db)?;
        Ok(balance)
    }

    async fn balance(&self, owner: &UserId) -> Result<i64> {
        let row = sqlx::query("SELECT balance FROM balances WHERE owner = ?")
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match row {
            Some(row) => row.try_get("balance").map_err(db),
            None => Ok(0),
        }
    }
}

async fn insert_quest(conn: &mut SqliteConnection, quest: &Quest) -> Result<()> {
    sqlx::query(
        "INSERT INTO quests (id, owner, title, author, description, rarity, cost, deadline,
            created, status, scope, is_new, template_id, generation_key, version, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(quest.id.to_string())
    .bind(quest.owner.as_str())
    .bind(&quest.title)
    .bind(&quest.author)
    .bind(&quest.description)
    .bind(quest.rarity.as_str())
    .bind(i64::from(quest.cost))
    .bind(quest.deadline)
    .bind(quest.created)
    .bind(quest.status.as_str())
    .bind(quest.scope.as_deref())
    .bind(quest.is_new)
    .bind(quest.template_id.map(|id| id.to_string()))
    .bind(quest.generation_key.as_deref())
    .bind(to_i64(quest.version)?)
    .bind(quest.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    for (position, subtask) in quest.subtasks.iter().enumerate() {
        let (completed, target, current) = kind_columns(&subtask.kind);
        sqlx::query(
            "INSERT INTO subtasks (id, quest_id, position, description, weight, kind,
                completed, target, current)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(subtask.id.to_string())
        .bind(quest.id.to_string())
        .bind(position as i64)
        .bind(&subtask.description)
        .bind(i64::from(subtask.weight))
        .bind(subtask.kind.as_str())
        .bind(completed)
        .bind(target)
        .bind(current)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }

    Ok(())
}

fn kind_columns(kind: &SubtaskKind) -> (Option<bool>, Option<f64>, Option<f64>) {
    match *kind {
        SubtaskKind::Checkbox { completed } => (Some(completed), None, None),
        SubtaskKind::Numeric { target, current } => (None, Some(target), Some(current)),
    }
}

fn quest_from_row(row: &SqliteRow) -> Result<Quest> {
    let template_id: Option<String> = row.try_get("template_id").map_err(db)?;
    let version: i64 = row.try_get("version").map_err(db)?;

    Ok(Quest {
        id: parse_id(row, "id")?,
        owner: UserId::new(row.try_get::<String, _>("owner").map_err(db)?),
        title: row.try_get("title").map_err(db)?,
        author: row.try_get("author").map_err(db)?,
        description: row.try_get("description").map_err(db)?,
        rarity: parse_label(row, "rarity")?,
        cost: to_u32(row.try_get("cost").map_err(db)?)?,
        deadline: row.try_get("deadline").map_err(db)?,
        created: row.try_get("created").map_err(db)?,
        status: parse_label(row, "status")?,
        scope: row.try_get("scope").map_err(db)?,
        is_new: row.try_get("is_new").map_err(db)?,
        subtasks: Vec::new(),
        template_id: template_id.map(|s| parse_str(&s)).transpose()?,
        generation_key: row.try_get("generation_key").map_err(db)?,
        version: u64::try_from(version)
            .map_err(|_| StorageError::Database(format!("negative version {}", version)))?,
        updated_at: row.try_get("updated_at").map_err(db)?,
    })
}

fn subtask_from_row(row: &SqliteRow) -> Result<Subtask> {
    let kind_label: String = row.try_get("kind").map_err(db)?;
    let kind = match kind_label.as_str() {
        "checkbox" => SubtaskKind::Checkbox {
            completed: row
                .try_get::<Option<bool>, _>("completed")
                .map_err(db)?
                .unwrap_or(false),
        },
        "numeric" => SubtaskKind::Numeric {
            target: row
                .try_get::<Option<f64>, _>("target")
                .map_err(db)?
                .unwrap_or(0.0),
            current: row
                .try_get::<Option<f64>, _>("current")
                .map_err(db)?
                .unwrap_or(0.0),
        },
        other => {
            return Err(StorageError::Database(format!(
                "unknown subtask kind {:?}",
                other
            )))
        }
    };

    Ok(Subtask {
        id: parse_id(row, "id")?,
        quest_id: parse_id(row, "quest_id")?,
        description: row.try_get("description").map_err(db)?,
        weight: to_u32(row.try_get("weight").map_err(db)?)?,
        kind,
    })
}

fn template_from_row(row: &SqliteRow) -> Result<QuestTemplate> {
    let weekdays: String = row.try_get("weekdays").map_err(db)?;
    let weekdays: BTreeSet<u8> = serde_json::from_str(&weekdays)?;
    let interval_hours: Option<i64> = row.try_get("interval_hours").map_err(db)?;

    Ok(QuestTemplate {
        id: parse_id(row, "id")?,
        owner: UserId::new(row.try_get::<String, _>("owner").map_err(db)?),
        title: row.try_get("title").map_err(db)?,
        author: row.try_get("author").map_err(db)?,
        description: row.try_get("description").map_err(db)?,
        cost: to_u32(row.try_get("cost").map_err(db)?)?,
        rarity: parse_label(row, "rarity")?,
        scope: row.try_get("scope").map_err(db)?,
        recurrence_type: RecurrenceType::from(
            row.try_get::<String, _>("recurrence_type").map_err(db)?,
        ),
        duration_hours: to_u32(row.try_get("duration_hours").map_err(db)?)?,
        weekdays,
        interval_hours: interval_hours.map(to_u32).transpose()?,
        is_active: row.try_get("is_active").map_err(db)?,
        start_at: row.try_get("start_at").map_err(db)?,
        end_at: row.try_get("end_at").map_err(db)?,
        last_generated: row.try_get("last_generated").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
    })
}

fn parse_id<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(db)?;
    parse_str(&raw)
}

fn parse_str<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StorageError::Database(format!("bad value {:?}: {}", raw, e)))
}

fn parse_label<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_id(row, column)
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StorageError::Database(format!("{} out of range", value)))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StorageError::Database(format!("{} out of range", value)))
}

fn db(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use questline_core::{QuestStatus, Rarity, SubtaskSpec, TemplateSpec};

    fn at(hour: u32) -> Time {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, 0, 0).unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_quest_with_subtasks_roundtrip() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let mut quest = Quest::new(alice(), "Paint fence", Rarity::Epic, 40, at(9))
            .with_deadline(at(18))
            .with_description("Both sides");
        quest.scope = Some("today".to_string());
        quest.subtasks.push(Subtask::from_spec(quest.id, SubtaskSpec::checkbox("Buy paint", 1)));
        quest.subtasks.push(Subtask::from_spec(quest.id, SubtaskSpec::numeric("Planks", 3, 20.0)));
        storage.create_quest(&quest, &[]).await.unwrap();

        let loaded = storage.load_quest(&alice(), quest.id).await.unwrap().unwrap();
        assert_eq!(loaded, quest);

        let listed = storage.list_quests(&alice(), &QuestFilter::default()).await.unwrap();
        assert_eq!(listed, vec![quest]);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let active = Quest::new(alice(), "A", Rarity::Common, 0, at(9));
        let mut inactive = Quest::new(alice(), "B", Rarity::Common, 0, at(10));
        inactive.status = QuestStatus::Inactive;
        storage.create_quest(&active, &[]).await.unwrap();
        storage.create_quest(&inactive, &[]).await.unwrap();

        let found = storage
            .list_quests(&alice(), &QuestFilter::with_status(QuestStatus::Inactive))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, inactive.id);
    }

    #[tokio::test]
    async fn test_update_quest_rejects_stale_version() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let quest = Quest::new(alice(), "Q", Rarity::Common, 5, at(9));
        storage.create_quest(&quest, &[]).await.unwrap();

        let mut done = quest.clone();
        done.status = QuestStatus::Finished;
        let stored = storage.update_quest(&done).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut failed = quest.clone();
        failed.status = QuestStatus::Failed;
        assert!(matches!(
            storage.update_quest(&failed).await,
            Err(StorageError::Conflict { expected: 0, .. })
        ));

        let mut missing = quest.clone();
        missing.id = QuestId::new();
        assert!(matches!(
            storage.update_quest(&missing).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_edges_and_subtasks() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let parent = Quest::new(alice(), "P", Rarity::Common, 0, at(9));
        let mut child = Quest::new(alice(), "C", Rarity::Common, 0, at(9));
        let subtask = Subtask::from_spec(child.id, SubtaskSpec::checkbox("step", 1));
        child.subtasks.push(subtask.clone());
        storage.create_quest(&parent, &[]).await.unwrap();
        storage.create_quest(&child, &[parent.id]).await.unwrap();

        assert_eq!(storage.children_of(&alice(), parent.id).await.unwrap(), vec![child.id]);

        storage.delete_quest(&alice(), child.id).await.unwrap();
        assert!(storage.children_of(&alice(), parent.id).await.unwrap().is_empty());
        assert!(storage.load_subtask(&alice(), subtask.id).await.unwrap().is_none());
        assert!(matches!(
            storage.delete_quest(&alice(), child.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_quests_span_users() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let late = Quest::new(alice(), "Late", Rarity::Common, 0, at(8)).with_deadline(at(10));
        let other = Quest::new(UserId::new("bob"), "Late too", Rarity::Common, 0, at(8))
            .with_deadline(at(11));
        let fine = Quest::new(alice(), "Fine", Rarity::Common, 0, at(8)).with_deadline(at(23));
        for quest in [&late, &other, &fine] {
            storage.create_quest(quest, &[]).await.unwrap();
        }

        let expired = storage.list_expired_quests(at(12)).await.unwrap();
        let ids: Vec<_> = expired.iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![late.id, other.id]);
    }

    #[tokio::test]
    async fn test_reward_balance() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(storage.add_reward(&alice(), 10).await.unwrap(), 10);
        assert_eq!(storage.add_reward(&alice(), 5).await.unwrap(), 15);
        assert!(matches!(
            storage.add_reward(&alice(), -16).await,
            Err(StorageError::NegativeBalance { balance: 15, .. })
        ));
        assert_eq!(storage.balance(&alice()).await.unwrap(), 15);
        assert_eq!(storage.balance(&UserId::new("bob")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_template_roundtrip_and_generation() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut spec = TemplateSpec::new("Gym", RecurrenceType::Weekly);
        spec.weekdays = [0, 3].into_iter().collect();
        spec.start_at = Some(at(7));
        let template = QuestTemplate::from_spec(alice(), spec, at(6)).unwrap();
        storage.save_template(&template).await.unwrap();

        let loaded = storage.load_template(&alice(), template.id).await.unwrap().unwrap();
        assert_eq!(loaded, template);

        let mut quest = Quest::new(alice(), "Gym", Rarity::Common, 0, at(8))
            .with_deadline(at(8) + Duration::hours(24));
        quest.template_id = Some(template.id);
        quest.generation_key = Some(template.generation_key());
        let first = storage.record_generation(&template, &quest, at(8)).await.unwrap();
        assert!(first.inserted);

        let mut retry = quest.clone();
        retry.id = QuestId::new();
        let second = storage.record_generation(&template, &retry, at(8)).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(first.quest.id, second.quest.id);

        let stored = storage.load_template(&alice(), template.id).await.unwrap().unwrap();
        assert_eq!(stored.last_generated, Some(at(8)));

        // An older timestamp never moves last_generated backwards.
        let mut older = quest.clone();
        older.id = QuestId::new();
        older.generation_key = Some("other".to_string());
        storage.record_generation(&template, &older, at(7)).await.unwrap();
        let stored = storage.load_template(&alice(), template.id).await.unwrap().unwrap();
        assert_eq!(stored.last_generated, Some(at(8)));
    }

    #[tokio::test]
    async fn test_unknown_recurrence_type_survives_storage() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut template = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Odd", RecurrenceType::Daily),
            at(6),
        )
        .unwrap();
        template.recurrence_type = RecurrenceType::Other("monthly".to_string());
        storage.save_template(&template).await.unwrap();

        let loaded = storage.load_template(&alice(), template.id).await.unwrap().unwrap();
        assert_eq!(loaded.recurrence_type, RecurrenceType::Other("monthly".to_string()));
        assert_eq!(storage.list_active_templates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_saving_stale_template_keeps_last_generated() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let template = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Stretch", RecurrenceType::Daily),
            at(6),
        )
        .unwrap();
        storage.save_template(&template).await.unwrap();

        let mut snapshot = storage.load_template(&alice(), template.id).await.unwrap().unwrap();
        let mut quest = Quest::new(alice(), "Stretch", Rarity::Common, 0, at(9));
        quest.generation_key = Some(template.generation_key());
        storage.record_generation(&template, &quest, at(9)).await.unwrap();

        snapshot.is_active = false;
        storage.save_template(&snapshot).await.unwrap();

        let stored = storage.load_template(&alice(), template.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.last_generated, Some(at(9)));
    }

    #[tokio::test]
    async fn test_sweep_reads_skip_undecodable_rows() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let good = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Good", RecurrenceType::Daily),
            at(6),
        )
        .unwrap();
        let broken = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Broken", RecurrenceType::Daily),
            at(6),
        )
        .unwrap();
        storage.save_template(&good).await.unwrap();
        storage.save_template(&broken).await.unwrap();
        sqlx::query("UPDATE quest_templates SET weekdays = 'not json' WHERE id = ?")
            .bind(broken.id.to_string())
            .execute(&storage.pool)
            .await
            .unwrap();

        let active = storage.list_active_templates().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, good.id);

        let late = Quest::new(alice(), "Late", Rarity::Common, 0, at(6)).with_deadline(at(7));
        let corrupt = Quest::new(alice(), "Corrupt", Rarity::Common, 0, at(6)).with_deadline(at(7));
        storage.create_quest(&late, &[]).await.unwrap();
        storage.create_quest(&corrupt, &[]).await.unwrap();
        sqlx::query("UPDATE quests SET rarity = 'mythic' WHERE id = ?")
            .bind(corrupt.id.to_string())
            .execute(&storage.pool)
            .await
            .unwrap();

        let expired = storage.list_expired_quests(at(8)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, late.id);
    }
}
