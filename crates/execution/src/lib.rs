//! Execution layer - dependency graph, quest lifecycle, recurrence and the
//! background scheduler.

pub mod error;
pub mod dependency;
pub mod lifecycle;
pub mod recurrence;
pub mod scheduler;

pub use error::{QuestError, Result};
pub use dependency::DependencyGraph;
pub use lifecycle::{QuestLifecycle, Transition};
pub use recurrence::{build_quest, should_generate, GenerationReport, RecurrenceEngine};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, TickReport, DEFAULT_POLL_INTERVAL};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use questline_core::{Quest, QuestId, QuestStatus, Rarity, Time, UserId};
    use questline_storage::{JsonStorage, SqliteStorage, Storage};

    /// 2024-03-04 (a Monday) at `hour`:00 UTC.
    pub fn at(hour: u32) -> Time {
        day(4, hour)
    }

    /// 2024-03-`d` at `hour`:00 UTC.
    pub fn day(d: u32, hour: u32) -> Time {
        Utc.with_ymd_and_hms(2024, 3, d, hour, 0, 0).unwrap()
    }

    pub fn alice() -> UserId {
        UserId::new("alice")
    }

    pub async fn sqlite() -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::in_memory().await.unwrap())
    }

    pub async fn json() -> (Arc<dyn Storage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        (Arc::new(storage), dir)
    }

    /// Store a quest directly, bypassing the lifecycle.
    pub async fn insert(
        storage: &Arc<dyn Storage>,
        title: &str,
        status: QuestStatus,
        parents: &[QuestId],
    ) -> Quest {
        let mut quest = Quest::new(alice(), title, Rarity::Common, 0, at(6));
        quest.status = status;
        storage.create_quest(&quest, parents).await.unwrap();
        quest
    }
}
