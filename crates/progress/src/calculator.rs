//! Weighted progress over a quest's subtasks.

use questline_core::{Quest, Subtask, SubtaskKind};
use serde::{Deserialize, Serialize};

/// Completion of a single quest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Rounded percentage, 0..=100
    pub percent: u8,

    /// Sum of all subtask weights
    pub total_weight: u32,

    /// Weight earned by ticked and partially reached subtasks
    pub completed_weight: f64,
}

impl ProgressReport {
    /// Progress of a quest without subtasks.
    pub fn empty() -> Self {
        Self {
            percent: 0,
            total_weight: 0,
            completed_weight: 0.0,
        }
    }
}

/// Weight earned by one subtask.
///
/// Numeric subtasks earn their share proportionally and are capped at the
/// full weight once `current` reaches `target`.
pub fn subtask_completion(subtask: &Subtask) -> f64 {
    let weight = f64::from(subtask.weight);
    match subtask.kind {
        SubtaskKind::Checkbox { completed: true } => weight,
        SubtaskKind::Checkbox { completed: false } => 0.0,
        SubtaskKind::Numeric { target, current } => {
            if target <= 0.0 || !current.is_finite() {
                return 0.0;
            }
            weight * (current / target).clamp(0.0, 1.0)
        }
    }
}

/// Compute a quest's weighted completion.
///
/// A quest without subtasks is always at 0; progress never drives status.
/// Halves round to the nearest even percent.
pub fn compute_progress(quest: &Quest) -> ProgressReport {
    let total_weight: u32 = quest.subtasks.iter().map(|s| s.weight).sum();
    if total_weight == 0 {
        return ProgressReport::empty();
    }

    let completed_weight: f64 = quest.subtasks.iter().map(subtask_completion).sum();
    let percent = (100.0 * completed_weight / f64::from(total_weight))
        .round_ties_even()
        .clamp(0.0, 100.0) as u8;

    ProgressReport {
        percent,
        total_weight,
        completed_weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questline_core::{QuestStatus, Rarity, SubtaskSpec, UserId};

    fn quest_with(subtasks: Vec<SubtaskSpec>) -> Quest {
        let mut quest = Quest::new(UserId::new("u"), "Q", Rarity::Common, 0, chrono::Utc::now());
        for spec in subtasks {
            quest.subtasks.push(Subtask::from_spec(quest.id, spec));
        }
        quest
    }

    fn tick(quest: &mut Quest, index: usize) {
        quest.subtasks[index].kind = SubtaskKind::Checkbox { completed: true };
    }

    #[test]
    fn test_no_subtasks_is_zero_in_any_status() {
        let mut quest = quest_with(vec![]);
        for status in QuestStatus::ALL {
            quest.status = status;
            assert_eq!(compute_progress(&quest), ProgressReport::empty());
        }
    }

    #[test]
    fn test_weighted_checkboxes() {
        let mut quest = quest_with(vec![
            SubtaskSpec::checkbox("small", 1),
            SubtaskSpec::checkbox("big", 3),
        ]);
        tick(&mut quest, 0);

        let report = compute_progress(&quest);
        assert_eq!(report.percent, 25);
        assert_eq!(report.total_weight, 4);
        assert_eq!(report.completed_weight, 1.0);

        tick(&mut quest, 1);
        assert_eq!(compute_progress(&quest).percent, 100);
    }

    #[test]
    fn test_numeric_is_proportional_and_capped() {
        let mut quest = quest_with(vec![SubtaskSpec::numeric("pages", 2, 10.0)]);

        quest.subtasks[0].kind = SubtaskKind::Numeric {
            target: 10.0,
            current: 5.0,
        };
        assert_eq!(subtask_completion(&quest.subtasks[0]), 1.0);
        assert_eq!(compute_progress(&quest).percent, 50);

        quest.subtasks[0].kind = SubtaskKind::Numeric {
            target: 10.0,
            current: 25.0,
        };
        assert_eq!(subtask_completion(&quest.subtasks[0]), 2.0);
        assert_eq!(compute_progress(&quest).percent, 100);
    }

    #[test]
    fn test_halves_round_to_even() {
        // 1 of 8 weight is exactly 12.5%.
        let mut quest = quest_with(vec![
            SubtaskSpec::checkbox("a", 1),
            SubtaskSpec::checkbox("b", 7),
        ]);
        tick(&mut quest, 0);
        assert_eq!(compute_progress(&quest).percent, 12);

        // 3 of 8 is 37.5%.
        let mut quest = quest_with(vec![
            SubtaskSpec::checkbox("a", 3),
            SubtaskSpec::checkbox("b", 5),
        ]);
        tick(&mut quest, 0);
        assert_eq!(compute_progress(&quest).percent, 38);
    }

    #[test]
    fn test_percent_stays_in_bounds() {
        let mut quest = quest_with(vec![
            SubtaskSpec::numeric("x", 100, 1.0),
            SubtaskSpec::checkbox("y", 1),
        ]);
        quest.subtasks[0].kind = SubtaskKind::Numeric {
            target: 1.0,
            current: 1e9,
        };
        tick(&mut quest, 1);
        let report = compute_progress(&quest);
        assert_eq!(report.percent, 100);
        assert!(report.completed_weight <= f64::from(report.total_weight));
    }
}
