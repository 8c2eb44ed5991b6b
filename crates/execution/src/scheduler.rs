//! Background sweep: recurring generation and deadline expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use questline_core::{QuestId, Time};
use questline_storage::Storage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QuestError;
use crate::lifecycle::QuestLifecycle;
use crate::recurrence::RecurrenceEngine;

/// Default time between sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between the end of one sweep and the start of the next
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    /// Override the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Quests generated from templates
    pub generated: Vec<QuestId>,

    /// Quests failed for a passed deadline
    pub expired: Vec<QuestId>,

    /// Per-item failures, logged and skipped
    pub failures: Vec<String>,
}

/// Periodic sweeper over templates and deadlines.
#[derive(Clone)]
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    lifecycle: QuestLifecycle,
    recurrence: RecurrenceEngine,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler over the given storage.
    pub fn new(storage: Arc<dyn Storage>, config: SchedulerConfig) -> Self {
        Self {
            lifecycle: QuestLifecycle::new(storage.clone()),
            recurrence: RecurrenceEngine::new(storage.clone()),
            storage,
            config,
        }
    }

    /// Run one sweep at `now`.
    ///
    /// Individual template or quest failures are collected in the report and
    /// never abort the sweep.
    pub async fn tick(&self, now: Time) -> TickReport {
        let mut report = TickReport::default();

        match self.recurrence.generate_all_due(now).await {
            Ok(generation) => {
                report.generated = generation.generated.iter().map(|q| q.id).collect();
                report.failures.extend(
                    generation
                        .failures
                        .into_iter()
                        .map(|(id, e)| format!("template {}: {}", id, e)),
                );
            }
            Err(e) => {
                error!(error = %e, "cannot list templates");
                report.failures.push(format!("templates: {}", e));
            }
        }

        match self.storage.list_expired_quests(now).await {
            Ok(expired) => {
                for quest in expired {
                    let id = quest.id;
                    match self.lifecycle.expire(quest, now).await {
                        Ok(Some(transition)) if transition.changed => report.expired.push(id),
                        Ok(_) => {}
                        Err(QuestError::Conflict(_)) => {
                            debug!(
                                quest_id = %id,
                                "quest changed during sweep, left for next tick"
                            );
                        }
                        Err(e) => {
                            warn!(quest_id = %id, error = %e, "cannot expire quest");
                            report.failures.push(format!("quest {}: {}", id, e));
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "cannot list expired quests");
                report.failures.push(format!("expired quests: {}", e));
            }
        }

        if !report.generated.is_empty()
            || !report.expired.is_empty()
            || !report.failures.is_empty()
        {
            info!(
                generated = report.generated.len(),
                expired = report.expired.len(),
                failures = report.failures.len(),
                "sweep finished"
            );
        }
        report
    }

    /// Sweep until `cancel` fires.
    ///
    /// Sweeps never overlap: the next one starts a full interval after the
    /// previous one finished.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.config.poll_interval.as_secs(), "scheduler started");
        loop {
            self.tick(Utc::now()).await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopped");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Start the sweep loop on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> SchedulerHandle {
        let task = tokio::spawn(self.run(cancel.clone()));
        SchedulerHandle { cancel, task }
    }
}

/// Owner handle of a running scheduler.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{alice, at, sqlite};
    use questline_core::{Quest, QuestStatus, QuestTemplate, Rarity, RecurrenceType, TemplateSpec};

    #[tokio::test]
    async fn test_tick_fails_expired_quests() {
        let storage = sqlite().await;
        let scheduler = Scheduler::new(storage.clone(), SchedulerConfig::default());

        let late = Quest::new(alice(), "Late", Rarity::Common, 0, at(6)).with_deadline(at(8));
        let fine = Quest::new(alice(), "Fine", Rarity::Common, 0, at(6)).with_deadline(at(20));
        storage.create_quest(&late, &[]).await.unwrap();
        storage.create_quest(&fine, &[]).await.unwrap();

        let report = scheduler.tick(at(9)).await;
        assert_eq!(report.expired, vec![late.id]);
        assert!(report.failures.is_empty());

        let late = storage.load_quest(&alice(), late.id).await.unwrap().unwrap();
        let fine = storage.load_quest(&alice(), fine.id).await.unwrap().unwrap();
        assert_eq!(late.status, QuestStatus::Failed);
        assert_eq!(fine.status, QuestStatus::Active);
    }

    #[tokio::test]
    async fn test_tick_generates_due_templates_once() {
        let storage = sqlite().await;
        let scheduler = Scheduler::new(storage.clone(), SchedulerConfig::default());
        let template = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Stretch", RecurrenceType::Daily),
            at(0),
        )
        .unwrap();
        storage.save_template(&template).await.unwrap();

        assert_eq!(scheduler.tick(at(9)).await.generated.len(), 1);
        assert!(scheduler.tick(at(10)).await.generated.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_template_type_does_not_break_sweep() {
        let storage = sqlite().await;
        let scheduler = Scheduler::new(storage.clone(), SchedulerConfig::default());

        let mut odd = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Odd", RecurrenceType::Daily),
            at(0),
        )
        .unwrap();
        odd.recurrence_type = RecurrenceType::Other("monthly".to_string());
        let good = QuestTemplate::from_spec(
            alice(),
            TemplateSpec::new("Good", RecurrenceType::Daily),
            at(0),
        )
        .unwrap();
        storage.save_template(&odd).await.unwrap();
        storage.save_template(&good).await.unwrap();

        let report = scheduler.tick(at(9)).await;
        assert_eq!(report.generated.len(), 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let storage = sqlite().await;
        let config = SchedulerConfig::default().with_poll_interval(Duration::from_secs(3600));
        let handle = Scheduler::new(storage, config).spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await;
        assert!(result.is_ok(), "scheduler should stop after cancel");
    }
}
