//! Quest templates - recurrence configuration that stamps out new quests.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{TemplateId, UserId};
use crate::quest::{Rarity, DEFAULT_AUTHOR, MAX_AUTHOR_LEN, MAX_DESCRIPTION_LEN, MAX_TITLE_LEN};
use crate::Time;

/// Deadline offset used when a template does not specify one.
pub const DEFAULT_DURATION_HOURS: u32 = 24;

/// How often a template fires.
///
/// Unknown values from storage are kept verbatim in [`RecurrenceType::Other`]
/// so they round-trip; such templates never fire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecurrenceType {
    /// Once per calendar day
    Daily,
    /// On selected weekdays
    Weekly,
    /// Every `interval_hours`
    Interval,
    /// Anything else found in storage
    Other(String),
}

impl RecurrenceType {
    /// Stored label.
    pub fn as_str(&self) -> &str {
        match self {
            RecurrenceType::Daily => "daily",
            RecurrenceType::Weekly => "weekly",
            RecurrenceType::Interval => "interval",
            RecurrenceType::Other(s) => s,
        }
    }
}

impl From<String> for RecurrenceType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "daily" => RecurrenceType::Daily,
            "weekly" => RecurrenceType::Weekly,
            "interval" => RecurrenceType::Interval,
            _ => RecurrenceType::Other(s),
        }
    }
}

impl From<&str> for RecurrenceType {
    fn from(s: &str) -> Self {
        RecurrenceType::from(s.to_string())
    }
}

impl From<RecurrenceType> for String {
    fn from(value: RecurrenceType) -> Self {
        match value {
            RecurrenceType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for RecurrenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring quest definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestTemplate {
    /// Unique identifier
    pub id: TemplateId,

    /// Owning user
    pub owner: UserId,

    /// Title copied onto generated quests
    pub title: String,

    /// Author copied onto generated quests
    pub author: String,

    /// Description copied onto generated quests
    pub description: String,

    /// Reward copied onto generated quests
    pub cost: u32,

    /// Rarity copied onto generated quests
    pub rarity: Rarity,

    /// Scope copied onto generated quests
    pub scope: Option<String>,

    /// Recurrence kind
    pub recurrence_type: RecurrenceType,

    /// Deadline offset for generated quests
    pub duration_hours: u32,

    /// Weekday indices, 0 = Monday (weekly only)
    #[serde(default)]
    pub weekdays: BTreeSet<u8>,

    /// Hours between generations (interval only)
    pub interval_hours: Option<u32>,

    /// Paused templates never fire
    pub is_active: bool,

    /// Generation window start; its time-of-day also gates daily/weekly
    pub start_at: Option<Time>,

    /// Generation window end
    pub end_at: Option<Time>,

    /// Most recent successful generation
    pub last_generated: Option<Time>,

    /// Creation timestamp
    pub created_at: Time,
}

/// Template settings supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Title
    pub title: String,
    /// Author label
    #[serde(default)]
    pub author: Option<String>,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Reward
    pub cost: u32,
    /// Rarity
    #[serde(default)]
    pub rarity: Rarity,
    /// Scope tag
    #[serde(default)]
    pub scope: Option<String>,
    /// Recurrence kind
    pub recurrence_type: RecurrenceType,
    /// Deadline offset for generated quests
    #[serde(default = "default_duration_hours")]
    pub duration_hours: u32,
    /// Weekday indices (weekly)
    #[serde(default)]
    pub weekdays: BTreeSet<u8>,
    /// Hours between generations (interval)
    #[serde(default)]
    pub interval_hours: Option<u32>,
    /// Start enabled
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Window start
    #[serde(default)]
    pub start_at: Option<Time>,
    /// Window end
    #[serde(default)]
    pub end_at: Option<Time>,
}

fn default_duration_hours() -> u32 {
    DEFAULT_DURATION_HOURS
}

fn default_true() -> bool {
    true
}

impl TemplateSpec {
    /// Minimal spec with defaults for everything optional.
    pub fn new(title: impl Into<String>, recurrence_type: RecurrenceType) -> Self {
        Self {
            title: title.into(),
            author: None,
            description: String::new(),
            cost: 0,
            rarity: Rarity::Common,
            scope: None,
            recurrence_type,
            duration_hours: DEFAULT_DURATION_HOURS,
            weekdays: BTreeSet::new(),
            interval_hours: None,
            is_active: true,
            start_at: None,
            end_at: None,
        }
    }
}

impl QuestTemplate {
    /// Build and validate a template from a user spec.
    pub fn from_spec(
        owner: UserId,
        spec: TemplateSpec,
        now: Time,
    ) -> Result<Self, ValidationError> {
        let template = Self {
            id: TemplateId::new(),
            owner,
            title: spec.title,
            author: spec.author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            description: spec.description,
            cost: spec.cost,
            rarity: spec.rarity,
            scope: spec.scope,
            recurrence_type: spec.recurrence_type,
            duration_hours: spec.duration_hours,
            weekdays: spec.weekdays,
            interval_hours: spec.interval_hours,
            is_active: spec.is_active,
            start_at: spec.start_at,
            end_at: spec.end_at,
            last_generated: None,
            created_at: now,
        };
        template.validate()?;
        Ok(template)
    }

    /// Reject incomplete recurrence settings and out-of-range fields.
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
        if self.duration_hours == 0 {
            return Err(ValidationError::InvalidRecurrenceConfig(
                "duration_hours must be >= 1".to_string(),
            ));
        }
        match self.recurrence_type {
            RecurrenceType::Weekly => {
                if self.weekdays.is_empty() {
                    return Err(ValidationError::InvalidRecurrenceConfig(
                        "weekly templates need weekdays".to_string(),
                    ));
                }
                if let Some(day) = self.weekdays.iter().find(|d| **d > 6) {
                    return Err(ValidationError::InvalidRecurrenceConfig(format!(
                        "weekday {} outside 0..=6",
                        day
                    )));
                }
            }
            RecurrenceType::Interval => {
                if !self.interval_hours.is_some_and(|h| h >= 1) {
                    return Err(ValidationError::InvalidRecurrenceConfig(
                        "interval templates need interval_hours >= 1".to_string(),
                    ));
                }
            }
            RecurrenceType::Daily => {}
            RecurrenceType::Other(ref other) => {
                return Err(ValidationError::InvalidRecurrenceConfig(format!(
                    "unknown recurrence type {:?}",
                    other
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if end < start {
                return Err(ValidationError::InvalidRecurrenceConfig(
                    "end_at is before start_at".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Key identifying the generation slot that follows `last_generated`.
    ///
    /// It only changes once a generation succeeds, so retrying a half-finished
    /// generation lands on the same key.
    pub fn generation_key(&self) -> String {
        match self.last_generated {
            Some(ts) => format!("{}:{}", self.id, ts.to_rfc3339()),
            None => format!("{}:initial", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> Time {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn owner() -> UserId {
        UserId::new("u1")
    }

    #[test]
    fn test_unknown_recurrence_type_round_trips() {
        let rt: RecurrenceType = serde_json::from_str("\"monthly\"").unwrap();
        assert_eq!(rt, RecurrenceType::Other("monthly".to_string()));
        assert_eq!(serde_json::to_string(&rt).unwrap(), "\"monthly\"");
        assert_eq!(
            serde_json::to_string(&RecurrenceType::Weekly).unwrap(),
            "\"weekly\""
        );
    }

    #[test]
    fn test_weekly_requires_weekdays() {
        let spec = TemplateSpec::new("Gym", RecurrenceType::Weekly);
        assert!(matches!(
            QuestTemplate::from_spec(owner(), spec.clone(), now()),
            Err(ValidationError::InvalidRecurrenceConfig(_))
        ));

        let mut spec = spec;
        spec.weekdays = [0, 7].into_iter().collect();
        assert!(QuestTemplate::from_spec(owner(), spec.clone(), now()).is_err());

        spec.weekdays = [0, 2].into_iter().collect();
        assert!(QuestTemplate::from_spec(owner(), spec, now()).is_ok());
    }

    #[test]
    fn test_interval_requires_hours() {
        let mut spec = TemplateSpec::new("Water plants", RecurrenceType::Interval);
        assert!(QuestTemplate::from_spec(owner(), spec.clone(), now()).is_err());
        spec.interval_hours = Some(0);
        assert!(QuestTemplate::from_spec(owner(), spec.clone(), now()).is_err());
        spec.interval_hours = Some(8);
        assert!(QuestTemplate::from_spec(owner(), spec, now()).is_ok());
    }

    #[test]
    fn test_defaults_applied() {
        let template = QuestTemplate::from_spec(
            owner(),
            TemplateSpec::new("Read", RecurrenceType::Daily),
            now(),
        )
        .unwrap();
        assert_eq!(template.author, DEFAULT_AUTHOR);
        assert_eq!(template.duration_hours, DEFAULT_DURATION_HOURS);
        assert!(template.is_active);
        assert!(template.last_generated.is_none());
    }

    #[test]
    fn test_generation_key_follows_last_generated() {
        let mut template = QuestTemplate::from_spec(
            owner(),
            TemplateSpec::new("Read", RecurrenceType::Daily),
            now(),
        )
        .unwrap();
        let initial = template.generation_key();
        assert!(initial.ends_with(":initial"));
        assert_eq!(initial, template.generation_key());

        template.last_generated = Some(now());
        assert_ne!(initial, template.generation_key());
    }
}
