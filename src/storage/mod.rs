//! Storage Layer Module
//!
//! Provides persistence for operation and request records.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    OperationStore, Page, Query, RequestStore, Sort, StorageError, StorageResult, StoreInfo,
};
