//! Quest service - the call surface used by front ends.
//!
//! Wraps the lifecycle, recurrence engine and progress calculator behind one
//! user-scoped API.

pub mod spec;
pub mod quests;
pub mod templates;

pub use spec::{QuestPatch, QuestSpec, TemplatePatch};
pub use quests::QuestService;
