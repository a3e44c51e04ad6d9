//! Storage module for local chunk and manifest persistence
//!
//! Uses sled embedded database.

pub mod store;

pub use store::{ChunkSeal, FileSummary, LocalStore, StorageError, StorageMetadata, StorageStats, StoreOutcome};
