//! Quest progress.
//!
//! Weighted completion percentages computed from a quest's subtasks, plus a
//! storage-backed tracker for looking them up by id.

pub mod calculator;
pub mod tracker;

pub use calculator::{compute_progress, subtask_completion, ProgressReport};
pub use tracker::{ProgressSnapshot, ProgressTracker, StorageProgressTracker};
