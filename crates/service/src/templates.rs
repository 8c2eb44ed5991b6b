//! Recurrence template operations.

use questline_core::{Quest, QuestTemplate, TemplateId, TemplateSpec, Time, UserId};
use questline_execution::{GenerationReport, QuestError, Result};
use tracing::info;

use crate::quests::QuestService;
use crate::spec::TemplatePatch;

impl QuestService {
    /// Validate and store a new template.
    ///
    /// Incomplete recurrence settings are rejected here, never at
    /// generation time.
    pub async fn create_template(
        &self,
        owner: &UserId,
        spec: TemplateSpec,
        now: Time,
    ) -> Result<QuestTemplate> {
        let template = QuestTemplate::from_spec(owner.clone(), spec, now)?;
        self.storage.save_template(&template).await?;
        info!(
            template_id = %template.id,
            recurrence = %template.recurrence_type,
            "template created"
        );
        Ok(template)
    }

    /// Load a template.
    pub async fn get_template(&self, owner: &UserId, id: TemplateId) -> Result<QuestTemplate> {
        self.storage
            .load_template(owner, id)
            .await?
            .ok_or_else(|| QuestError::NotFound(format!("template {}", id)))
    }

    /// A user's templates, optionally only the active ones.
    pub async fn list_templates(
        &self,
        owner: &UserId,
        active_only: bool,
    ) -> Result<Vec<QuestTemplate>> {
        Ok(self.storage.list_templates(owner, active_only).await?)
    }

    /// Edit a template. The result is validated like a new one.
    pub async fn update_template(
        &self,
        owner: &UserId,
        id: TemplateId,
        patch: TemplatePatch,
    ) -> Result<QuestTemplate> {
        let mut template = self.get_template(owner, id).await?;
        patch.apply(&mut template);
        template.validate()?;
        self.storage.save_template(&template).await?;
        // Storage keeps its own last_generated; return what was stored.
        self.get_template(owner, id).await
    }

    /// Delete a template. Quests it generated are kept.
    pub async fn delete_template(&self, owner: &UserId, id: TemplateId) -> Result<()> {
        self.storage.delete_template(owner, id).await?;
        info!(template_id = %id, "template deleted");
        Ok(())
    }

    /// Generate from a template now, whether or not it is due.
    pub async fn trigger_generation(
        &self,
        owner: &UserId,
        id: TemplateId,
        now: Time,
    ) -> Result<Quest> {
        self.recurrence.trigger(owner, id, now).await
    }

    /// Generate every due template of the user. Failing templates are
    /// reported, not raised.
    pub async fn generate_due_quests(&self, owner: &UserId, now: Time) -> Result<GenerationReport> {
        self.recurrence.generate_due_for(owner, now).await
    }
}
