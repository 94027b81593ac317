//! SQLite Persistent Storage
//!
//! Durable storage for operation and request records; the cross-restart
//! source of truth. Uses connection pooling via r2d2 for concurrent access.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::path::Path;

use super::traits::{
    OperationStore, Page, Query, RequestStore, StorageError, StorageResult, StoreInfo,
};
use crate::types::{
    request_key, ActionRecord, BridgeRequest, OperationRecord, RequestId, RequestKind,
    RequestStatus,
};

const OPERATION_COLUMNS: &str = "id, type, status, requester, vault, btc_address, amount, \
     actions, error, btc_txid, signed_tx, created_at, last_update";

const REQUEST_COLUMNS: &str =
    "kind, id, requester, vault, btc_address, amount, status, btc_tx, opentime, last_update";

/// SQLite-backed store with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                requester TEXT NOT NULL,
                vault TEXT NOT NULL,
                btc_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                actions TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                btc_txid TEXT,
                signed_tx TEXT,
                created_at INTEGER NOT NULL,
                last_update INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
            CREATE INDEX IF NOT EXISTS idx_operations_last_update ON operations(last_update);

            CREATE TABLE IF NOT EXISTS requests (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                requester TEXT NOT NULL,
                vault TEXT NOT NULL,
                btc_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                status INTEGER NOT NULL,
                btc_tx TEXT,
                opentime INTEGER NOT NULL,
                last_update INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_vault ON requests(kind, vault, opentime, id);
            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(kind, status);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    /// Map a camelCase query field to its operations column
    fn operation_column(field: &str) -> Result<&'static str, StorageError> {
        match field {
            "id" => Ok("id"),
            "type" => Ok("type"),
            "status" => Ok("status"),
            "requester" => Ok("requester"),
            "vault" => Ok("vault"),
            "btcAddress" => Ok("btc_address"),
            "amount" => Ok("amount"),
            "btcTxid" => Ok("btc_txid"),
            "createdAt" => Ok("created_at"),
            "lastUpdate" => Ok("last_update"),
            other => Err(StorageError::InvalidData(format!(
                "unknown operation field: {}",
                other
            ))),
        }
    }

    /// Map a camelCase query field to its requests column
    fn request_column(field: &str) -> Result<&'static str, StorageError> {
        match field {
            "id" => Ok("id"),
            "requester" => Ok("requester"),
            "vault" => Ok("vault"),
            "btcAddress" => Ok("btc_address"),
            "amount" => Ok("amount"),
            "status" => Ok("status"),
            "btcTx" => Ok("btc_tx"),
            "opentime" => Ok("opentime"),
            "lastUpdate" => Ok("last_update"),
            other => Err(StorageError::InvalidData(format!(
                "unknown request field: {}",
                other
            ))),
        }
    }

    /// Convert a database row to OperationRecord
    fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<OperationRecord> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let actions: String = row.get("actions")?;

        let id = id.parse::<RequestId>().map_err(|e| conversion_error(0, e))?;
        let status = status.parse().map_err(|e: String| conversion_error(2, e))?;
        let actions: Vec<ActionRecord> =
            serde_json::from_str(&actions).map_err(|e| conversion_error(7, e))?;

        Ok(OperationRecord {
            id,
            op_type: row.get("type")?,
            status,
            requester: row.get("requester")?,
            vault: row.get("vault")?,
            btc_address: row.get("btc_address")?,
            amount: row.get::<_, i64>("amount")? as u64,
            actions,
            error: row.get("error")?,
            btc_txid: row.get("btc_txid")?,
            signed_tx: row.get("signed_tx")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            last_update: row.get::<_, i64>("last_update")? as u64,
        })
    }

    /// Convert a database row to BridgeRequest
    fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<BridgeRequest> {
        let kind: String = row.get("kind")?;
        let id: String = row.get("id")?;
        let status: i64 = row.get("status")?;

        let kind = match kind.as_str() {
            "issue" => RequestKind::Issue,
            "redeem" => RequestKind::Redeem,
            other => return Err(conversion_error(0, format!("unknown kind {}", other))),
        };
        let id = id.parse::<RequestId>().map_err(|e| conversion_error(1, e))?;
        let status = RequestStatus::try_from(status as u8).map_err(|e| conversion_error(6, e))?;

        Ok(BridgeRequest {
            kind,
            id,
            requester: row.get("requester")?,
            vault: row.get("vault")?,
            btc_address: row.get("btc_address")?,
            amount: row.get::<_, i64>("amount")? as u64,
            status,
            btc_tx: row.get("btc_tx")?,
            opentime: row.get::<_, i64>("opentime")? as u64,
            last_update: row.get::<_, i64>("last_update")? as u64,
        })
    }

    // Synchronous helper methods for the trait implementations

    fn write_operation_sync(&self, record: &OperationRecord, replace: bool) -> StorageResult<bool> {
        let conn = self.conn()?;
        let actions = serde_json::to_string(&record.actions)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let verb = if replace {
            "INSERT OR REPLACE"
        } else {
            "INSERT OR IGNORE"
        };

        let rows = conn
            .execute(
                &format!(
                    "{} INTO operations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    verb, OPERATION_COLUMNS
                ),
                params![
                    record.id.to_hex(),
                    record.op_type,
                    record.status.as_str(),
                    record.requester,
                    record.vault,
                    record.btc_address,
                    record.amount as i64,
                    actions,
                    record.error,
                    record.btc_txid,
                    record.signed_tx,
                    record.created_at as i64,
                    record.last_update as i64,
                ],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(rows > 0)
    }

    fn get_operation_sync(&self, id: &RequestId) -> StorageResult<Option<OperationRecord>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS),
            params![id.to_hex()],
            Self::row_to_operation,
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn query_operations_sync(&self, query: &Query) -> StorageResult<Page<OperationRecord>> {
        let (where_sql, values) = build_where(query, Self::operation_column)?;
        let order_sql = match &query.sort {
            Some(sort) => format!(
                "ORDER BY {} {}, id ASC",
                Self::operation_column(&sort.field)?,
                if sort.is_descending() { "DESC" } else { "ASC" }
            ),
            None => "ORDER BY id ASC".to_string(),
        };

        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM operations {}", where_sql),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let sql = format!(
            "SELECT {} FROM operations {} {} {}",
            OPERATION_COLUMNS,
            where_sql,
            order_sql,
            limit_sql(query.page, query.size)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_operation)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Page::new(records, total as u64, query.page, query.size))
    }

    fn operations_info_sync(&self) -> StorageResult<StoreInfo> {
        let conn = self.conn()?;

        let (total, last_update): (i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(last_update) FROM operations",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(StoreInfo {
            total: total as u64,
            last_update: last_update.map(|v| v as u64),
        })
    }

    fn in_progress_sync(&self) -> StorageResult<Vec<OperationRecord>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM operations WHERE status IN ('RUNNING', 'ROLLING_BACK') \
                 ORDER BY created_at ASC, id ASC",
                OPERATION_COLUMNS
            ))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let records = stmt
            .query_map([], Self::row_to_operation)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(records)
    }

    fn upsert_request_sync(&self, request: &BridgeRequest) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO requests (key, {}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                REQUEST_COLUMNS
            ),
            params![
                request.key(),
                request.kind.to_string(),
                request.id.to_hex(),
                request.requester,
                request.vault,
                request.btc_address,
                request.amount as i64,
                u8::from(request.status) as i64,
                request.btc_tx,
                request.opentime as i64,
                request.last_update as i64,
            ],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    fn get_request_sync(
        &self,
        kind: RequestKind,
        id: &RequestId,
    ) -> StorageResult<Option<BridgeRequest>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM requests WHERE key = ?1", REQUEST_COLUMNS),
            params![request_key(kind, id)],
            Self::row_to_request,
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn issues_for_vault_sync(
        &self,
        vault: &str,
        page: usize,
        size: usize,
    ) -> StorageResult<Page<BridgeRequest>> {
        let conn = self.conn()?;

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM requests WHERE kind = 'issue' AND vault = ?1 COLLATE NOCASE",
                params![vault],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM requests WHERE kind = 'issue' AND vault = ?1 COLLATE NOCASE \
                 ORDER BY opentime ASC, id ASC {}",
                REQUEST_COLUMNS,
                limit_sql(page, size)
            ))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let records = stmt
            .query_map(params![vault], Self::row_to_request)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Page::new(records, total as u64, page, size))
    }

    fn query_requests_sync(
        &self,
        kind: RequestKind,
        query: &Query,
    ) -> StorageResult<Page<BridgeRequest>> {
        let mut scoped = query.clone();
        scoped.filter.remove("kind");
        let (mut where_sql, mut values) = build_where(&scoped, Self::request_column)?;

        values.push(kind.to_string());
        let kind_clause = format!("kind = ?{}", values.len());
        where_sql = if where_sql.is_empty() {
            format!("WHERE {}", kind_clause)
        } else {
            format!("{} AND {}", where_sql, kind_clause)
        };

        let order_sql = match &query.sort {
            Some(sort) => format!(
                "ORDER BY {} {}, id ASC",
                Self::request_column(&sort.field)?,
                if sort.is_descending() { "DESC" } else { "ASC" }
            ),
            None => "ORDER BY id ASC".to_string(),
        };

        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM requests {}", where_sql),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM requests {} {} {}",
                REQUEST_COLUMNS,
                where_sql,
                order_sql,
                limit_sql(query.page, query.size)
            ))
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_request)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Page::new(records, total as u64, query.page, query.size))
    }

    fn non_terminal_sync(&self, kind: RequestKind) -> StorageResult<Vec<BridgeRequest>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM requests WHERE kind = ?1 AND status IN (0, 1) \
                 ORDER BY opentime ASC, id ASC",
                REQUEST_COLUMNS
            ))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let records = stmt
            .query_map(params![kind.to_string()], Self::row_to_request)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(records)
    }

    fn latest_opentime_sync(&self, kind: RequestKind) -> StorageResult<Option<u64>> {
        let conn = self.conn()?;

        let latest: Option<i64> = conn
            .query_row(
                "SELECT MAX(opentime) FROM requests WHERE kind = ?1",
                params![kind.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(latest.map(|v| v as u64))
    }
}

/// `WHERE` clause with positional parameters for the filter map
fn build_where(
    query: &Query,
    column: fn(&str) -> Result<&'static str, StorageError>,
) -> StorageResult<(String, Vec<String>)> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    for (field, value) in &query.filter {
        values.push(value.clone());
        clauses.push(format!("{} = ?{}", column(field)?, values.len()));
    }

    if clauses.is_empty() {
        Ok((String::new(), values))
    } else {
        Ok((format!("WHERE {}", clauses.join(" AND ")), values))
    }
}

fn limit_sql(page: usize, size: usize) -> String {
    if size == 0 {
        String::new()
    } else {
        format!("LIMIT {} OFFSET {}", size, page.saturating_mul(size))
    }
}

fn conversion_error<E: ToString>(column: usize, err: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(StorageError::InvalidData(err.to_string())),
    )
}

#[async_trait]
impl OperationStore for SqliteStore {
    async fn create_operation(&self, record: &OperationRecord) -> StorageResult<bool> {
        self.write_operation_sync(record, false)
    }

    async fn upsert_operation(&self, record: &OperationRecord) -> StorageResult<()> {
        self.write_operation_sync(record, true).map(|_| ())
    }

    async fn get_operation(&self, id: &RequestId) -> StorageResult<Option<OperationRecord>> {
        self.get_operation_sync(id)
    }

    async fn query_operations(&self, query: &Query) -> StorageResult<Page<OperationRecord>> {
        self.query_operations_sync(query)
    }

    async fn operations_info(&self) -> StorageResult<StoreInfo> {
        self.operations_info_sync()
    }

    async fn in_progress_operations(&self) -> StorageResult<Vec<OperationRecord>> {
        self.in_progress_sync()
    }
}

#[async_trait]
impl RequestStore for SqliteStore {
    async fn upsert_request(&self, request: &BridgeRequest) -> StorageResult<()> {
        self.upsert_request_sync(request)
    }

    async fn get_request(
        &self,
        kind: RequestKind,
        id: &RequestId,
    ) -> StorageResult<Option<BridgeRequest>> {
        self.get_request_sync(kind, id)
    }

    async fn issues_for_vault(
        &self,
        vault: &str,
        page: usize,
        size: usize,
    ) -> StorageResult<Page<BridgeRequest>> {
        self.issues_for_vault_sync(vault, page, size)
    }

    async fn query_requests(
        &self,
        kind: RequestKind,
        query: &Query,
    ) -> StorageResult<Page<BridgeRequest>> {
        self.query_requests_sync(kind, query)
    }

    async fn non_terminal_requests(&self, kind: RequestKind) -> StorageResult<Vec<BridgeRequest>> {
        self.non_terminal_sync(kind)
    }

    async fn latest_opentime(&self, kind: RequestKind) -> StorageResult<Option<u64>> {
        self.latest_opentime_sync(kind)
    }
}
