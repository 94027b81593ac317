//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the service restarts.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use super::traits::{
    OperationStore, Page, Query, RequestStore, StorageError, StorageResult, StoreInfo,
};
use crate::types::{
    request_key, BridgeRequest, OperationRecord, OperationStatus, RequestId, RequestKind,
};

/// In-memory operation and request store
///
/// Thread-safe storage keyed by id.
/// Uses Arc<RwLock<>> for concurrent access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    /// Operations indexed by 0x-hex id
    operations: Arc<RwLock<HashMap<String, OperationRecord>>>,
    /// Requests indexed by "kind:id"
    requests: Arc<RwLock<HashMap<String, BridgeRequest>>>,
    #[cfg(test)]
    failing_writes: Arc<AtomicU32>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operation writes fail
    #[cfg(test)]
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, AtomicOrdering::SeqCst);
    }

    fn check_write(&self) -> StorageResult<()> {
        #[cfg(test)]
        {
            let remaining = self.failing_writes.load(AtomicOrdering::SeqCst);
            if remaining > 0 {
                self.failing_writes.store(remaining - 1, AtomicOrdering::SeqCst);
                return Err(StorageError::Connection("injected write failure".into()));
            }
        }
        Ok(())
    }
}

/// Filter, sort and page serializable records
fn run_query<T: Serialize + Clone>(records: Vec<T>, query: &Query) -> StorageResult<Page<T>> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let value =
            serde_json::to_value(&record).map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let matches = query
            .filter
            .iter()
            .all(|(field, expected)| field_as_string(&value, field).as_deref() == Some(expected));
        if matches {
            rows.push((value, record));
        }
    }

    if let Some(sort) = &query.sort {
        rows.sort_by(|(a, _), (b, _)| {
            let ordering = compare_values(a.get(&sort.field), b.get(&sort.field));
            if sort.is_descending() {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    let items = rows.into_iter().map(|(_, record)| record).collect();
    Ok(Page::slice(items, query.page, query.size))
}

fn field_as_string(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) | (Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None) | (Some(_), Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn create_operation(&self, record: &OperationRecord) -> StorageResult<bool> {
        self.check_write()?;
        let mut operations = self.operations.write().await;
        let key = record.id.to_hex();

        if operations.contains_key(&key) {
            return Ok(false);
        }
        operations.insert(key, record.clone());
        Ok(true)
    }

    async fn upsert_operation(&self, record: &OperationRecord) -> StorageResult<()> {
        self.check_write()?;
        let mut operations = self.operations.write().await;
        operations.insert(record.id.to_hex(), record.clone());
        Ok(())
    }

    async fn get_operation(&self, id: &RequestId) -> StorageResult<Option<OperationRecord>> {
        let operations = self.operations.read().await;
        Ok(operations.get(&id.to_hex()).cloned())
    }

    async fn query_operations(&self, query: &Query) -> StorageResult<Page<OperationRecord>> {
        let mut records: Vec<OperationRecord> =
            self.operations.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        run_query(records, query)
    }

    async fn operations_info(&self) -> StorageResult<StoreInfo> {
        let operations = self.operations.read().await;
        Ok(StoreInfo {
            total: operations.len() as u64,
            last_update: operations.values().map(|r| r.last_update).max(),
        })
    }

    async fn in_progress_operations(&self) -> StorageResult<Vec<OperationRecord>> {
        let operations = self.operations.read().await;
        let mut records: Vec<OperationRecord> = operations
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    OperationStatus::Running | OperationStatus::RollingBack
                )
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(records)
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn upsert_request(&self, request: &BridgeRequest) -> StorageResult<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.key(), request.clone());
        Ok(())
    }

    async fn get_request(
        &self,
        kind: RequestKind,
        id: &RequestId,
    ) -> StorageResult<Option<BridgeRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(&request_key(kind, id)).cloned())
    }

    async fn issues_for_vault(
        &self,
        vault: &str,
        page: usize,
        size: usize,
    ) -> StorageResult<Page<BridgeRequest>> {
        let requests = self.requests.read().await;
        let mut issues: Vec<BridgeRequest> = requests
            .values()
            .filter(|r| r.kind == RequestKind::Issue && r.is_for_vault(vault))
            .cloned()
            .collect();
        issues.sort_by(|a, b| (a.opentime, a.id).cmp(&(b.opentime, b.id)));
        Ok(Page::slice(issues, page, size))
    }

    async fn query_requests(
        &self,
        kind: RequestKind,
        query: &Query,
    ) -> StorageResult<Page<BridgeRequest>> {
        let mut records: Vec<BridgeRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        run_query(records, query)
    }

    async fn non_terminal_requests(&self, kind: RequestKind) -> StorageResult<Vec<BridgeRequest>> {
        let requests = self.requests.read().await;
        let mut records: Vec<BridgeRequest> = requests
            .values()
            .filter(|r| r.kind == kind && !r.status.is_terminal())
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.opentime, a.id).cmp(&(b.opentime, b.id)));
        Ok(records)
    }

    async fn latest_opentime(&self, kind: RequestKind) -> StorageResult<Option<u64>> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.kind == kind)
            .map(|r| r.opentime)
            .max())
    }
}
