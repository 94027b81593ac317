//! Shared Types Module
//!
//! Data types shared across the vault client.

pub mod operation;
pub mod request;
pub mod units;

// Re-exports for convenience
pub use operation::{
    ActionRecord, ActionStatus, OperationParams, OperationRecord, OperationStatus, OperationType,
};
pub use request::{
    now_secs, request_key, BridgeRequest, RequestId, RequestIdError, RequestKind, RequestStatus,
};
pub use units::{
    amount_from_contract, parse_sats, sats_to_btc_string, sats_to_display, validate_amount,
    AmountError, MAX_MONEY_SATS, SATS_PER_BTC,
};
