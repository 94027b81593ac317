//! Storage Trait Definitions
//!
//! Defines abstract storage interfaces for operation and request records.
//! Implementations can use SQLite (production) or in-memory (testing).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{BridgeRequest, OperationRecord, RequestId, RequestKind};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Single-field sort; `direction` is 1 (ascending) or -1 (descending)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: i8,
}

impl Sort {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: 1,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: -1,
        }
    }

    pub fn is_descending(&self) -> bool {
        self.direction < 0
    }
}

/// Paged query over records; filter values match by equality on camelCase field names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    #[serde(default)]
    pub sort: Option<Sort>,
    /// Zero-based page index
    #[serde(default)]
    pub page: usize,
    /// Page size; 0 returns everything
    #[serde(default)]
    pub size: usize,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, field: &str, value: impl ToString) -> Self {
        self.filter.insert(field.to_string(), value.to_string());
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn paged(mut self, page: usize, size: usize) -> Self {
        self.page = page;
        self.size = size;
        self
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: u64,
    pub total_pages: u64,
    pub size: usize,
    pub page: usize,
}

impl<T> Page<T> {
    /// Page metadata for `total` matching records
    pub fn new(content: Vec<T>, total: u64, page: usize, size: usize) -> Self {
        let total_pages = if size == 0 {
            1
        } else {
            total.div_ceil(size as u64)
        };

        Self {
            content,
            total_elements: total,
            total_pages,
            size,
            page,
        }
    }

    /// Slice an already filtered and sorted list
    pub fn slice(items: Vec<T>, page: usize, size: usize) -> Self {
        let total = items.len() as u64;
        let content = if size == 0 {
            items
        } else {
            items
                .into_iter()
                .skip(page.saturating_mul(size))
                .take(size)
                .collect()
        };
        Self::new(content, total, page, size)
    }
}

/// Store summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub total: u64,
    pub last_update: Option<u64>,
}

/// Operation record storage
///
/// Implementations:
/// - `SqliteStore` - Production storage with SQLite
/// - `MemoryStore` - In-memory storage for testing
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert if absent; false when the id already exists
    async fn create_operation(&self, record: &OperationRecord) -> StorageResult<bool>;

    /// Insert or replace by id
    async fn upsert_operation(&self, record: &OperationRecord) -> StorageResult<()>;

    async fn get_operation(&self, id: &RequestId) -> StorageResult<Option<OperationRecord>>;

    async fn query_operations(&self, query: &Query) -> StorageResult<Page<OperationRecord>>;

    async fn operations_info(&self) -> StorageResult<StoreInfo>;

    /// Operations whose persisted status is RUNNING or ROLLING_BACK
    async fn in_progress_operations(&self) -> StorageResult<Vec<OperationRecord>>;
}

/// Issue/redeem request storage
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn upsert_request(&self, request: &BridgeRequest) -> StorageResult<()>;

    async fn get_request(
        &self,
        kind: RequestKind,
        id: &RequestId,
    ) -> StorageResult<Option<BridgeRequest>>;

    /// Issues assigned to `vault`, ordered by opentime then id
    async fn issues_for_vault(
        &self,
        vault: &str,
        page: usize,
        size: usize,
    ) -> StorageResult<Page<BridgeRequest>>;

    async fn query_requests(
        &self,
        kind: RequestKind,
        query: &Query,
    ) -> StorageResult<Page<BridgeRequest>>;

    /// Requests not yet COMPLETED or CANCELLED
    async fn non_terminal_requests(&self, kind: RequestKind) -> StorageResult<Vec<BridgeRequest>>;

    /// Newest opentime seen for `kind`
    async fn latest_opentime(&self, kind: RequestKind) -> StorageResult<Option<u64>>;
}
