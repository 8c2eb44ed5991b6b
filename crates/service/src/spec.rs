//! Input types for creating and editing quests and templates.

use std::collections::BTreeSet;

use questline_core::{
    Quest, QuestId, QuestStatus, QuestTemplate, Rarity, Subtask, SubtaskSpec, Time, UserId,
};
use serde::{Deserialize, Serialize};

/// Input for creating a quest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestSpec {
    /// Title
    pub title: String,
    /// Author label, defaults to `???`
    #[serde(default)]
    pub author: Option<String>,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Rarity
    #[serde(default)]
    pub rarity: Rarity,
    /// Reward
    #[serde(default)]
    pub cost: u32,
    /// Deadline
    #[serde(default)]
    pub deadline: Option<Time>,
    /// Planning tag
    #[serde(default)]
    pub scope: Option<String>,
    /// Quests this one depends on
    #[serde(default)]
    pub parents: Vec<QuestId>,
    /// Sub-steps
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
    /// Create as an abstract placeholder
    #[serde(default)]
    pub is_abstract: bool,
}

impl QuestSpec {
    /// A quest with just a title, rarity and reward.
    pub fn new(title: impl Into<String>, rarity: Rarity, cost: u32) -> Self {
        Self {
            title: title.into(),
            author: None,
            description: String::new(),
            rarity,
            cost,
            deadline: None,
            scope: None,
            parents: Vec::new(),
            subtasks: Vec::new(),
            is_abstract: false,
        }
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Time) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the parents.
    pub fn with_parents(mut self, parents: Vec<QuestId>) -> Self {
        self.parents = parents;
        self
    }

    /// Add a subtask.
    pub fn with_subtask(mut self, subtask: SubtaskSpec) -> Self {
        self.subtasks.push(subtask);
        self
    }

    /// Set the scope tag.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub(crate) fn into_quest(self, owner: UserId, now: Time) -> (Quest, Vec<QuestId>) {
        let mut quest = Quest::new(owner, self.title, self.rarity, self.cost, now)
            .with_description(self.description);
        if let Some(author) = self.author {
            quest.author = author;
        }
        quest.deadline = self.deadline;
        quest.scope = self.scope;
        if self.is_abstract {
            quest.status = QuestStatus::Abstract;
        }
        let quest_id = quest.id;
        quest.subtasks = self
            .subtasks
            .into_iter()
            .map(|spec| Subtask::from_spec(quest_id, spec))
            .collect();
        (quest, self.parents)
    }
}

/// Field edits for a quest. `None` leaves a field unchanged; the nested
/// options clear the field when set to `Some(None)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestPatch {
    /// New title
    pub title: Option<String>,
    /// New author label
    pub author: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New or cleared deadline
    pub deadline: Option<Option<Time>>,
    /// New rarity
    pub rarity: Option<Rarity>,
    /// New reward
    pub cost: Option<u32>,
    /// New or cleared scope
    pub scope: Option<Option<String>>,
}

impl QuestPatch {
    pub(crate) fn apply(self, quest: &mut Quest) {
        if let Some(title) = self.title {
            quest.title = title;
        }
        if let Some(author) = self.author {
            quest.author = author;
        }
        if let Some(description) = self.description {
            quest.description = description;
        }
        if let Some(deadline) = self.deadline {
            quest.deadline = deadline;
        }
        if let Some(rarity) = self.rarity {
            quest.rarity = rarity;
        }
        if let Some(cost) = self.cost {
            quest.cost = cost;
        }
        if let Some(scope) = self.scope {
            quest.scope = scope;
        }
    }
}

/// Field edits for a template, re-validated after applying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatePatch {
    /// New title
    pub title: Option<String>,
    /// New author label
    pub author: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New reward
    pub cost: Option<u32>,
    /// New rarity
    pub rarity: Option<Rarity>,
    /// New or cleared scope
    pub scope: Option<Option<String>>,
    /// New deadline offset
    pub duration_hours: Option<u32>,
    /// New weekday set
    pub weekdays: Option<BTreeSet<u8>>,
    /// New or cleared interval
    pub interval_hours: Option<Option<u32>>,
    /// Pause or resume
    pub is_active: Option<bool>,
    /// New or cleared window start
    pub start_at: Option<Option<Time>>,
    /// New or cleared window end
    pub end_at: Option<Option<Time>>,
}

impl TemplatePatch {
    pub(crate) fn apply(self, template: &mut QuestTemplate) {
        if let Some(title) = self.title {
            template.title = title;
        }
        if let Some(author) = self.author {
            template.author = author;
        }
        if let Some(description) = self.description {
            template.description = description;
        }
        if let Some(cost) = self.cost {
            template.cost = cost;
        }
        if let Some(rarity) = self.rarity {
            template.rarity = rarity;
        }
        if let Some(scope) = self.scope {
            template.scope = scope;
        }
        if let Some(duration_hours) = self.duration_hours {
            template.duration_hours = duration_hours;
        }
        if let Some(weekdays) = self.weekdays {
            template.weekdays = weekdays;
        }
        if let Some(interval_hours) = self.interval_hours {
            template.interval_hours = interval_hours;
        }
        if let Some(is_active) = self.is_active {
            template.is_active = is_active;
        }
        if let Some(start_at) = self.start_at {
            template.start_at = start_at;
        }
        if let Some(end_at) = self.end_at {
            template.end_at = end_at;
        }
    }
}
