//! Restart recovery
//!
//! Rebuilds every operation the store still shows as in progress. Records
//! with an unknown type are reported and left untouched.

use tracing::{error, info};

use crate::operation::{Operation, OperationDeps};
use crate::storage::StorageError;

/// Operations to resume, oldest first
pub async fn load_operations(deps: &OperationDeps) -> Result<Vec<Operation>, StorageError> {
    let mut records = deps.store.in_progress_operations().await?;
    records.sort_by_key(|r| (r.created_at, r.id));

    let mut operations = Vec::with_capacity(records.len());
    for record in records {
        info!(
            target: "vault::operation",
            id = %record.id,
            op_type = %record.op_type,
            status = %record.status,
            btc_address = %record.btc_address,
            amount = record.amount,
            "Restoring operation"
        );

        let id = record.id;
        match Operation::resume(record, deps.clone()) {
            Ok(operation) => operations.push(operation),
            Err(e) => {
                error!(target: "vault::operation", id = %id, error = %e, "Cannot restore operation");
            }
        }
    }

    Ok(operations)
}
