//! Quest model - the core unit of work in Questline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{QuestId, TemplateId, UserId};
use crate::subtask::Subtask;
use crate::Time;

/// Maximum title length (characters).
pub const MAX_TITLE_LEN: usize = 200;
/// Maximum author label length (characters).
pub const MAX_AUTHOR_LEN: usize = 100;
/// Maximum description length (characters).
pub const MAX_DESCRIPTION_LEN: usize = 2000;
/// Maximum number of parents a quest may depend on.
pub const MAX_PARENTS: usize = 10;
/// Author label used when none is given.
pub const DEFAULT_AUTHOR: &str = "???";

/// A quest is a user task with a lifecycle status and a reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    /// Unique identifier
    pub id: QuestId,

    /// Owning user
    pub owner: UserId,

    /// Quest title
    pub title: String,

    /// Author label
    pub author: String,

    /// Free-text description
    pub description: String,

    /// Rarity tier
    pub rarity: Rarity,

    /// Reward granted on completion
    pub cost: u32,

    /// Optional deadline
    pub deadline: Option<Time>,

    /// Creation timestamp
    pub created: Time,

    /// Lifecycle status
    pub status: QuestStatus,

    /// Planning tag (`today`, `not_today_<date>`, or anything else)
    pub scope: Option<String>,

    /// Unread flag
    pub is_new: bool,

    /// Weighted sub-steps
    #[serde(default)]
    pub subtasks: Vec<Subtask>,

    /// Template this quest was generated from
    #[serde(default)]
    pub template_id: Option<TemplateId>,

    /// Idempotency key for template generation
    #[serde(default)]
    pub generation_key: Option<String>,

    /// Optimistic concurrency version, bumped by every stored update
    #[serde(default)]
    pub version: u64,

    /// Last update timestamp
    pub updated_at: Time,
}

impl Quest {
    /// Create a new active quest with default author and no subtasks.
    pub fn new(
        owner: UserId,
        title: impl Into<String>,
        rarity: Rarity,
        cost: u32,
        now: Time,
    ) -> Self {
        Self {
            id: QuestId::new(),
            owner,
            title: title.into(),
            author: DEFAULT_AUTHOR.to_string(),
            description: String::new(),
            rarity,
            cost,
            deadline: None,
            created: now,
            status: QuestStatus::Active,
            scope: None,
            is_new: true,
            subtasks: Vec::new(),
            template_id: None,
            generation_key: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Time) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the author label.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// True when the quest is active and its deadline has passed.
    pub fn is_expired(&self, now: Time) -> bool {
        self.status == QuestStatus::Active && self.deadline.is_some_and(|d| d < now)
    }

    /// Check the text field limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let title_len = self.title.chars().count();
        if title_len == 0 || title_len > MAX_TITLE_LEN {
            return Err(ValidationError::InvalidField {
                field: "title",
                reason: format!("must be 1..={} characters", MAX_TITLE_LEN),
            });
        }
        if self.author.chars().count() > MAX_AUTHOR_LEN {
            return Err(ValidationError::InvalidField {
                field: "author",
                reason: format!("must be at most {} characters", MAX_AUTHOR_LEN),
            });
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ValidationError::InvalidField {
                field: "description",
                reason: format!("must be at most {} characters", MAX_DESCRIPTION_LEN),
            });
        }
        Ok(())
    }
}

/// Quest rarity, ordered from least to most rare.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    /// Common
    #[default]
    #[serde(alias = "Обычный")]
    Common,
    /// Uncommon
    #[serde(alias = "Необычный")]
    Uncommon,
    /// Rare
    #[serde(alias = "Редкий")]
    Rare,
    /// Epic
    #[serde(alias = "Эпический")]
    Epic,
    /// Legendary
    #[serde(alias = "Легендарный")]
    Legendary,
}

impl Rarity {
    /// Stored label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::Epic => "epic",
            Rarity::Legendary => "legendary",
        }
    }

    /// Position in the rarity order, starting at 1.
    pub fn ordinal(&self) -> u8 {
        match self {
            Rarity::Common => 1,
            Rarity::Uncommon => 2,
            Rarity::Rare => 3,
            Rarity::Epic => 4,
            Rarity::Legendary => 5,
        }
    }
}

impl std::fmt::Display for Rarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Rarity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "common" | "обычный" => Ok(Rarity::Common),
            "uncommon" | "необычный" => Ok(Rarity::Uncommon),
            "rare" | "редкий" => Ok(Rarity::Rare),
            "epic" | "эпический" => Ok(Rarity::Epic),
            "legendary" | "легендарный" => Ok(Rarity::Legendary),
            _ => Err(ValidationError::UnknownLabel {
                kind: "rarity",
                value: s.to_string(),
            }),
        }
    }
}

/// Quest lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestStatus {
    /// Waiting on unfinished parents
    #[serde(alias = "Неактивный")]
    Inactive,
    /// Workable
    #[serde(alias = "Выполняется")]
    Active,
    /// Completed successfully
    #[serde(alias = "Завершённый")]
    Finished,
    /// Failed or expired
    #[serde(alias = "Проваленный")]
    Failed,
    /// Placeholder quest that never activates on its own
    #[serde(alias = "Абстрактный")]
    Abstract,
}

impl QuestStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [QuestStatus; 5] = [
        QuestStatus::Inactive,
        QuestStatus::Active,
        QuestStatus::Finished,
        QuestStatus::Failed,
        QuestStatus::Abstract,
    ];

    /// Stored label.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestStatus::Inactive => "inactive",
            QuestStatus::Active => "active",
            QuestStatus::Finished => "finished",
            QuestStatus::Failed => "failed",
            QuestStatus::Abstract => "abstract",
        }
    }

    /// Finished and failed end the quest and release its children.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QuestStatus::Finished | QuestStatus::Failed)
    }
}

impl std::fmt::Display for QuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuestStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inactive" | "неактивный" => Ok(QuestStatus::Inactive),
            "active" | "выполняется" => Ok(QuestStatus::Active),
            "finished" | "завершённый" => Ok(QuestStatus::Finished),
            "failed" | "проваленный" => Ok(QuestStatus::Failed),
            "abstract" | "абстрактный" => Ok(QuestStatus::Abstract),
            _ => Err(ValidationError::UnknownLabel {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Planning-view scope tags.
pub mod scope {
    use chrono::NaiveDate;

    /// Pins a quest to today's plan.
    pub const TODAY: &str = "today";

    /// Tag that hides a quest from the candidate list for `date`.
    pub fn not_today(date: NaiveDate) -> String {
        format!("not_today_{}", date.format("%Y-%m-%d"))
    }
}

/// True when `scope` keeps a quest out of the candidate list on `date`.
pub fn is_planned_or_dismissed(scope: Option<&str>, date: NaiveDate) -> bool {
    match scope {
        Some(s) => s == scope::TODAY || s == scope::not_today(date),
        None => false,
    }
}

/// Sort keys for quest listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Creation time
    #[default]
    Created,
    /// Deadline, quests without one last
    Deadline,
    /// Title, case-insensitive
    Title,
    /// Reward
    Cost,
    /// Rarity tier
    Rarity,
}

impl std::str::FromStr for SortKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SortKey::Created),
            "deadline" => Ok(SortKey::Deadline),
            "title" => Ok(SortKey::Title),
            "cost" => Ok(SortKey::Cost),
            "rarity" => Ok(SortKey::Rarity),
            _ => Err(ValidationError::UnknownLabel {
                kind: "sort key",
                value: s.to_string(),
            }),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest first
    #[default]
    Asc,
    /// Largest first
    Desc,
}

/// Filter for querying quests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestFilter {
    /// Filter by status
    pub status: Option<Vec<QuestStatus>>,

    /// Filter by exact scope tag
    pub scope: Option<String>,

    /// Case-insensitive text search over title, author, description and labels
    #[serde(default)]
    pub search: Option<String>,

    /// Sort key applied by [`QuestFilter::sort`]
    #[serde(default)]
    pub sort_by: SortKey,

    /// Sort direction
    #[serde(default)]
    pub order: SortOrder,
}

impl QuestFilter {
    /// Quests in a single status.
    pub fn with_status(status: QuestStatus) -> Self {
        Self {
            status: Some(vec![status]),
            ..Self::default()
        }
    }

    /// Quests carrying the given scope tag.
    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..Self::default()
        }
    }

    /// Everything that is no longer active.
    pub fn archived() -> Self {
        Self {
            status: Some(
                QuestStatus::ALL
                    .into_iter()
                    .filter(|s| *s != QuestStatus::Active)
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Add a text search.
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// Set the sort key and direction.
    pub fn sorted_by(mut self, key: SortKey, order: SortOrder) -> Self {
        self.sort_by = key;
        self.order = order;
        self
    }

    /// Does the quest pass this filter?
    pub fn matches(&self, quest: &Quest) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&quest.status) {
                return false;
            }
        }
        if let Some(scope) = &self.scope {
            if quest.scope.as_deref() != Some(scope.as_str()) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.trim().to_lowercase();
            if !needle.is_empty() {
                let hit = [
                    quest.title.as_str(),
                    quest.author.as_str(),
                    quest.description.as_str(),
                    quest.rarity.as_str(),
                    quest.status.as_str(),
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
                if !hit {
                    return false;
                }
            }
        }
        true
    }

    /// Order quests by the configured key. Ties keep creation order.
    pub fn sort(&self, quests: &mut [Quest]) {
        quests.sort_by(|a, b| {
            let ordering = match self.sort_by {
                SortKey::Created => a.created.cmp(&b.created),
                SortKey::Deadline => match (a.deadline, b.deadline) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
                SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
                SortKey::Cost => a.cost.cmp(&b.cost),
                SortKey::Rarity => a.rarity.cmp(&b.rarity),
            };
            match self.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
            .then_with(|| a.created.cmp(&b.created))
        });
    }
}
