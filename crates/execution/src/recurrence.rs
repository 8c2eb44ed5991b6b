//! Recurrence engine: decides when a template is due and stamps out quests.

use std::sync::Arc;

use chrono::{Datelike, Duration};
use questline_core::{Quest, QuestStatus, QuestTemplate, RecurrenceType, TemplateId, Time, UserId};
use questline_storage::{Generation, Storage};
use tracing::{debug, info, warn};

use crate::error::{QuestError, Result};

/// Is the template due at `now`?
///
/// All calendar checks are in UTC. Unknown recurrence types never fire.
pub fn should_generate(template: &QuestTemplate, now: Time) -> bool {
    if !template.is_active {
        return false;
    }
    if template.start_at.is_some_and(|start| now < start) {
        return false;
    }
    if template.end_at.is_some_and(|end| now > end) {
        return false;
    }

    match &template.recurrence_type {
        RecurrenceType::Daily => {
            if !past_time_of_day(template, now) {
                return false;
            }
            match template.last_generated {
                None => true,
                Some(last) => last.date_naive() < now.date_naive(),
            }
        }
        RecurrenceType::Weekly => {
            let weekday = now.weekday().num_days_from_monday() as u8;
            if !template.weekdays.contains(&weekday) {
                return false;
            }
            if !past_time_of_day(template, now) {
                return false;
            }
            match template.last_generated {
                None => true,
                Some(last) => last.date_naive() < now.date_naive(),
            }
        }
        RecurrenceType::Interval => {
            let Some(hours) = template.interval_hours else {
                return false;
            };
            match template.last_generated {
                None => true,
                Some(last) => now - last >= Duration::hours(i64::from(hours)),
            }
        }
        RecurrenceType::Other(_) => false,
    }
}

/// Daily and weekly templates fire no earlier than `start_at`'s time of day.
fn past_time_of_day(template: &QuestTemplate, now: Time) -> bool {
    match template.start_at {
        Some(start) => now.time() >= start.time(),
        None => true,
    }
}

/// Build the quest a template produces at `now`, without persisting it.
pub fn build_quest(template: &QuestTemplate, now: Time) -> Quest {
    let mut quest = Quest::new(
        template.owner.clone(),
        template.title.clone(),
        template.rarity,
        template.cost,
        now,
    )
    .with_author(template.author.clone())
    .with_description(template.description.clone())
    .with_deadline(now + Duration::hours(i64::from(template.duration_hours)));

    quest.status = QuestStatus::Active;
    quest.scope = template.scope.clone();
    quest.template_id = Some(template.id);
    quest.generation_key = Some(template.generation_key());
    quest
}

/// Outcome of a batch of generations.
#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Quests newly inserted by this batch
    pub generated: Vec<Quest>,

    /// Templates that failed, with the error text
    pub failures: Vec<(TemplateId, String)>,
}

/// Materializes quests from templates.
#[derive(Clone)]
pub struct RecurrenceEngine {
    storage: Arc<dyn Storage>,
}

impl RecurrenceEngine {
    /// Create an engine over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Create the template's next quest and advance `last_generated`.
    ///
    /// Does not check [`should_generate`]. Retrying after a partial failure
    /// returns the quest from the first attempt instead of a duplicate.
    pub async fn generate(&self, template: &QuestTemplate, now: Time) -> Result<Quest> {
        Ok(self.record(template, now).await?.quest)
    }

    async fn record(&self, template: &QuestTemplate, now: Time) -> Result<Generation> {
        let quest = build_quest(template, now);
        let generation = self.storage.record_generation(template, &quest, now).await?;
        if generation.inserted {
            info!(
                template_id = %template.id,
                quest_id = %generation.quest.id,
                recurrence = %template.recurrence_type,
                "quest generated from template"
            );
        }
        Ok(generation)
    }

    /// Generate for one template of a user, regardless of whether it is due.
    pub async fn trigger(&self, owner: &UserId, id: TemplateId, now: Time) -> Result<Quest> {
        let template = self
            .storage
            .load_template(owner, id)
            .await?
            .ok_or_else(|| QuestError::NotFound(format!("template {}", id)))?;
        self.generate(&template, now).await
    }

    /// Generate every due template of one user.
    pub async fn generate_due_for(&self, owner: &UserId, now: Time) -> Result<GenerationReport> {
        let templates = self.storage.list_templates(owner, true).await?;
        Ok(self.generate_due(templates, now).await)
    }

    /// Generate every due template of every user.
    pub async fn generate_all_due(&self, now: Time) -> Result<GenerationReport> {
        let templates = self.storage.list_active_templates().await?;
        Ok(self.generate_due(templates, now).await)
    }

    /// A failing template is logged and skipped; the rest still run.
    async fn generate_due(&self, templates: Vec<QuestTemplate>, now: Time) -> GenerationReport {
        let mut report = GenerationReport::default();
        for template in templates {
            if !should_generate(&template, now) {
                continue;
            }
            match self.record(&template, now).await {
                Ok(generation) if generation.inserted => report.generated.push(generation.quest),
                Ok(generation) => {
                    debug!(
                        template_id = %template.id,
                        quest_id = %generation.quest.id,
                        "generation slot already filled"
                    );
                }
                Err(e) => {
                    warn!(template_id = %template.id, error = %e, "generation failed");
                    report.failures.push((template.id, e.to_string()));
                }
            }
        }
        debug!(
            generated = report.generated.len(),
            failed = report.failures.len(),
            "template sweep finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{alice, at, day, sqlite};
    use chrono::{TimeZone, Utc};
    use questline_core::{QuestFilter, TemplateSpec};

    fn template(spec: TemplateSpec) -> QuestTemplate {
        QuestTemplate::from_spec(alice(), spec, at(0)).unwrap()
    }

    fn daily() -> QuestTemplate {
        template(TemplateSpec::new("Stretch", RecurrenceType::Daily))
    }

    #[test]
    fn test_inactive_and_window() {
        let mut t = daily();
        assert!(should_generate(&t, at(9)));

        t.is_active = false;
        assert!(!should_generate(&t, at(9)));

        t.is_active = true;
        t.start_at = Some(day(5, 0));
        assert!(!should_generate(&t, at(9)));

        t.start_at = None;
        t.end_at = Some(at(8));
        assert!(!should_generate(&t, at(9)));
    }

    #[test]
    fn test_daily_once_per_calendar_day() {
        let mut t = daily();
        t.last_generated = Some(at(8));
        assert!(!should_generate(&t, at(23)));
        assert!(should_generate(&t, day(5, 0)));
    }

    #[test]
    fn test_daily_time_of_day_gate() {
        let mut t = daily();
        t.start_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap());
        assert!(!should_generate(&t, at(7)));
        assert!(should_generate(&t, at(8)));
    }

    #[test]
    fn test_weekly_monday_scenario() {
        // 2024-03-04 is a Monday.
        let mut spec = TemplateSpec::new("Plan week", RecurrenceType::Weekly);
        spec.weekdays = [0].into_iter().collect();
        spec.start_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap());
        let mut t = template(spec);

        assert!(!should_generate(&t, at(7)));
        assert!(should_generate(&t, at(9)));

        t.last_generated = Some(at(9));
        assert!(!should_generate(&t, at(15)));
        assert!(!should_generate(&t, day(5, 9)));
        assert!(should_generate(&t, day(11, 9)));
    }

    #[test]
    fn test_interval_never_fires_twice_within_interval() {
        let mut spec = TemplateSpec::new("Water plants", RecurrenceType::Interval);
        spec.interval_hours = Some(6);
        let mut t = template(spec);

        let mut now = at(0);
        let end = day(7, 0);
        let mut fired = Vec::new();
        while now < end {
            if should_generate(&t, now) {
                if let Some(last) = fired.last() {
                    assert!(now - *last >= Duration::hours(6));
                }
                fired.push(now);
                t.last_generated = Some(now);
            }
            now += Duration::minutes(17);
        }
        assert!(fired.len() > 1);
    }

    #[test]
    fn test_unknown_type_is_inert() {
        let mut t = daily();
        t.recurrence_type = RecurrenceType::Other("monthly".to_string());
        assert!(!should_generate(&t, at(9)));
    }

    #[test]
    fn test_build_quest_copies_template() {
        let mut spec = TemplateSpec::new("Stretch", RecurrenceType::Daily);
        spec.cost = 15;
        spec.scope = Some("today".to_string());
        spec.duration_hours = 24;
        let t = template(spec);

        let quest = build_quest(&t, at(9));
        assert_eq!(quest.title, "Stretch");
        assert_eq!(quest.cost, 15);
        assert_eq!(quest.scope.as_deref(), Some("today"));
        assert_eq!(quest.deadline, Some(day(5, 9)));
        assert_eq!(quest.status, QuestStatus::Active);
        assert!(quest.is_new);
        assert_eq!(quest.template_id, Some(t.id));
    }

    #[tokio::test]
    async fn test_generate_advances_last_generated() {
        let storage = sqlite().await;
        let engine = RecurrenceEngine::new(storage.clone());
        let t = daily();
        storage.save_template(&t).await.unwrap();

        let report = engine.generate_due_for(&alice(), at(9)).await.unwrap();
        assert_eq!(report.generated.len(), 1);

        let stored = storage.load_template(&alice(), t.id).await.unwrap().unwrap();
        assert_eq!(stored.last_generated, Some(at(9)));
        assert!(!should_generate(&stored, at(10)));

        let again = engine.generate_due_for(&alice(), at(10)).await.unwrap();
        assert!(again.generated.is_empty());
    }

    #[tokio::test]
    async fn test_retry_with_stale_template_does_not_duplicate() {
        let storage = sqlite().await;
        let engine = RecurrenceEngine::new(storage.clone());
        let t = daily();
        storage.save_template(&t).await.unwrap();

        // Same template snapshot twice, as after a crash before the caller
        // saw the updated timestamp.
        let first = engine.generate(&t, at(9)).await.unwrap();
        let second = engine.generate(&t, at(9)).await.unwrap();
        assert_eq!(first.id, second.id);

        let quests = storage.list_quests(&alice(), &QuestFilter::default()).await.unwrap();
        assert_eq!(quests.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_with_stale_template_reports_nothing_new() {
        let storage = sqlite().await;
        let engine = RecurrenceEngine::new(storage.clone());
        let t = daily();
        storage.save_template(&t).await.unwrap();

        let first = engine.generate_due(vec![t.clone()], at(9)).await;
        assert_eq!(first.generated.len(), 1);

        // `t` still has no last_generated, so it looks due again.
        let second = engine.generate_due(vec![t], at(9)).await;
        assert!(second.generated.is_empty());
        assert!(second.failures.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_unknown_template() {
        let storage = sqlite().await;
        let engine = RecurrenceEngine::new(storage);
        assert!(matches!(
            engine.trigger(&alice(), TemplateId::new(), at(9)).await,
            Err(QuestError::NotFound(_))
        ));
    }
}
