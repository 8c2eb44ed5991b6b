//! Storage abstraction and implementations for Questline.
//!
//! This crate provides a trait-based storage interface with two backends: a
//! document-style JSON file store and a relational SQLite store.

pub mod trait_;
#[cfg(feature = "json")]
pub mod json_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{Generation, Result, Storage, StorageError};
#[cfg(feature = "json")]
pub use json_storage::JsonStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
