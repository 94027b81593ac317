//! Bridge Request Types
//!
//! Issue (deposit) and redeem (burn) requests as mirrored from the bridge
//! contract. The core only reads these; the sync loop writes them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Request id parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestIdError {
    #[error("empty request id")]
    Empty,

    #[error("request id does not fit in 256 bits: {0}")]
    Overflow(String),

    #[error("invalid request id: {0}")]
    Invalid(String),
}

/// 256-bit request id, big-endian (contract `uint256`)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RequestId([u8; 32]);

impl RequestId {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Full-width `0x` hex, the canonical storage key
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    fn parse_hex(digits: &str) -> Result<Self, RequestIdError> {
        if digits.len() > 64 {
            return Err(RequestIdError::Overflow(digits.to_string()));
        }
        let padded = format!("{:0>64}", digits);
        let bytes = hex::decode(&padded).map_err(|e| RequestIdError::Invalid(e.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    fn parse_decimal(digits: &str) -> Result<Self, RequestIdError> {
        let mut out = [0u8; 32];
        for ch in digits.chars() {
            let digit = ch
                .to_digit(10)
                .ok_or_else(|| RequestIdError::Invalid(digits.to_string()))?;

            // out = out * 10 + digit
            let mut carry = digit;
            for byte in out.iter_mut().rev() {
                let v = (*byte as u32) * 10 + carry;
                *byte = (v & 0xff) as u8;
                carry = v >> 8;
            }
            if carry != 0 {
                return Err(RequestIdError::Overflow(digits.to_string()));
            }
        }
        Ok(Self(out))
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RequestIdError::Empty);
        }
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Err(RequestIdError::Empty),
            Some(digits) => Self::parse_hex(digits),
            None => Self::parse_decimal(s),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.to_hex())
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which side of the bridge a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// BTC deposited to a vault address, token minted on the contract chain
    Issue,
    /// Token burned on the contract chain, BTC released by the vault
    Redeem,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issue => write!(f, "issue"),
            Self::Redeem => write!(f, "redeem"),
        }
    }
}

/// Contract-side request status (numeric on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RequestStatus {
    None = 0,
    Pending = 1,
    Completed = 2,
    Cancelled = 3,
}

impl RequestStatus {
    /// Terminal requests are evicted from the sync loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl From<RequestStatus> for u8 {
    fn from(status: RequestStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for RequestStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Pending),
            2 => Ok(Self::Completed),
            3 => Ok(Self::Cancelled),
            other => Err(format!("unknown request status: {}", other)),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// An issue or redeem request mirrored from the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub kind: RequestKind,
    pub id: RequestId,
    /// Contract-chain account that opened the request
    pub requester: String,
    /// Vault the request is assigned to
    pub vault: String,
    /// Bech32 address, or `0x` hex of a 20-byte witness program
    pub btc_address: String,
    /// Amount in satoshis
    pub amount: u64,
    pub status: RequestStatus,
    /// Correlated BTC transaction id
    pub btc_tx: Option<String>,
    /// Open time (unix seconds)
    pub opentime: u64,
    /// Last update (unix seconds)
    pub last_update: u64,
}

impl BridgeRequest {
    /// Storage key: kind and id
    pub fn key(&self) -> String {
        request_key(self.kind, &self.id)
    }

    pub fn is_for_vault(&self, vault: &str) -> bool {
        self.vault.eq_ignore_ascii_case(vault)
    }
}

/// Storage key shared by both stores
pub fn request_key(kind: RequestKind, id: &RequestId) -> String {
    format!("{}:{}", kind, id.to_hex())
}

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_parsing() {
        let from_dec: RequestId = "255".parse().unwrap();
        let from_hex: RequestId = "0xff".parse().unwrap();
        assert_eq!(from_dec, from_hex);
        assert_eq!(from_dec, RequestId::from_u64(255));
        assert_eq!(from_dec.as_bytes()[31], 0xff);
        assert!(from_dec.to_hex().starts_with("0x000000"));
        assert_eq!(from_dec.to_hex().len(), 66);
    }

    #[test]
    fn test_request_id_large_decimal() {
        // 2^64
        let id: RequestId = "18446744073709551616".parse().unwrap();
        assert_eq!(id.as_bytes()[23], 1);
        assert!(id.as_bytes()[24..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_request_id_rejects_garbage() {
        assert_eq!("".parse::<RequestId>(), Err(RequestIdError::Empty));
        assert!("0x".parse::<RequestId>().is_err());
        assert!("12ab".parse::<RequestId>().is_err());
        assert!(format!("0x{}", "f".repeat(65)).parse::<RequestId>().is_err());
        // 2^256
        let too_big = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert!(matches!(
            too_big.parse::<RequestId>(),
            Err(RequestIdError::Overflow(_))
        ));
    }

    #[test]
    fn test_request_serde() {
        let request = BridgeRequest {
            kind: RequestKind::Redeem,
            id: RequestId::from_u64(7),
            requester: "0xuser".into(),
            vault: "0xVault".into(),
            btc_address: "tb1qexample".into(),
            amount: 6_000,
            status: RequestStatus::Pending,
            btc_tx: None,
            opentime: 1,
            last_update: 1,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["status"], 1);
        assert_eq!(json["kind"], "redeem");
        assert!(json["btcAddress"].is_string());

        let back: BridgeRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
        assert!(back.is_for_vault("0xvault"));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::None.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
    }
}
