//! Operation Types
//!
//! The persisted shape of an operation: one record per originating request id,
//! upserted after every transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::request::{now_secs, BridgeRequest, RequestId};
use crate::common::config::ConfigError;

/// Kind of work an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Redeem,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redeem => "REDEEM",
        }
    }
}

impl FromStr for OperationType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "REDEEM" => Ok(Self::Redeem),
            _ => Err(ConfigError::UnsupportedOperation(s.to_string())),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Transient, never persisted
    Created,
    Running,
    Completed,
    RollingBack,
    RolledBack,
    /// Terminal; needs manual intervention
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// Allowed forward transitions
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Completed)
                | (Running, RollingBack)
                | (Running, Failed)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "ROLLING_BACK" => Ok(Self::RollingBack),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown operation status: {}", other)),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Executed,
    RolledBack,
    /// Broadcast happened (or may have); the step cannot be undone
    BroadcastUnconfirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub name: String,
    pub status: ActionStatus,
}

/// Payload an operation is created from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationParams {
    pub id: RequestId,
    pub requester: String,
    pub vault: String,
    pub btc_address: String,
    pub amount: u64,
}

impl From<&BridgeRequest> for OperationParams {
    fn from(request: &BridgeRequest) -> Self {
        Self {
            id: request.id,
            requester: request.requester.clone(),
            vault: request.vault.clone(),
            btc_address: request.btc_address.clone(),
            amount: request.amount,
        }
    }
}

/// Persisted operation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: RequestId,
    /// Raw type tag; parsed when the pipeline is rebuilt
    #[serde(rename = "type")]
    pub op_type: String,
    pub status: OperationStatus,
    pub requester: String,
    pub vault: String,
    pub btc_address: String,
    pub amount: u64,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub error: Option<String>,
    /// Informational only; recovery searches by content
    #[serde(default)]
    pub btc_txid: Option<String>,
    /// Signed payout (consensus hex), saved before it is first broadcast
    #[serde(default)]
    pub signed_tx: Option<String>,
    pub created_at: u64,
    pub last_update: u64,
}

impl OperationRecord {
    pub fn new(op_type: OperationType, params: &OperationParams, action_names: &[&str]) -> Self {
        let now = now_secs();
        Self {
            id: params.id,
            op_type: op_type.as_str().to_string(),
            status: OperationStatus::Created,
            requester: params.requester.clone(),
            vault: params.vault.clone(),
            btc_address: params.btc_address.clone(),
            amount: params.amount,
            actions: action_names
                .iter()
                .map(|name| ActionRecord {
                    name: name.to_string(),
                    status: ActionStatus::Pending,
                })
                .collect(),
            error: None,
            btc_txid: None,
            signed_tx: None,
            created_at: now,
            last_update: now,
        }
    }

    pub fn params(&self) -> OperationParams {
        OperationParams {
            id: self.id,
            requester: self.requester.clone(),
            vault: self.vault.clone(),
            btc_address: self.btc_address.clone(),
            amount: self.amount,
        }
    }

    pub fn operation_type(&self) -> Result<OperationType, ConfigError> {
        self.op_type.parse()
    }

    pub fn action_status(&self, name: &str) -> Option<ActionStatus> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.status)
    }

    pub fn set_action_status(&mut self, name: &str, status: ActionStatus) {
        if let Some(action) = self.actions.iter_mut().find(|a| a.name == name) {
            action.status = status;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_update = now_secs();
    }
}
