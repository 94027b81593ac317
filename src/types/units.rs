//! Satoshi Amount Utilities
//!
//! Amounts are integer satoshis everywhere. These helpers validate amounts at
//! the boundaries (contract payloads, CLI input) and format them for logs.

use thiserror::Error;

/// Satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Maximum amount that can ever exist (21M BTC)
pub const MAX_MONEY_SATS: u64 = 21_000_000 * SATS_PER_BTC;

/// Amount validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount must be greater than zero")]
    Zero,

    #[error("amount {0} exceeds the maximum supply")]
    TooLarge(u128),

    #[error("amount {amount} is below the dust limit of {limit} sats")]
    BelowDust { amount: u64, limit: u64 },

    #[error("invalid amount: {0}")]
    Unparseable(String),
}

/// Check that an amount is non-zero and within the supply cap
pub fn validate_amount(sats: u64) -> Result<u64, AmountError> {
    if sats == 0 {
        return Err(AmountError::Zero);
    }
    if sats > MAX_MONEY_SATS {
        return Err(AmountError::TooLarge(sats as u128));
    }
    Ok(sats)
}

/// Narrow a contract-side `uint` amount to satoshis
pub fn amount_from_contract(value: u128) -> Result<u64, AmountError> {
    if value > MAX_MONEY_SATS as u128 {
        return Err(AmountError::TooLarge(value));
    }
    validate_amount(value as u64)
}

/// Convert satoshis to BTC string (e.g., "0.00100000")
pub fn sats_to_btc_string(sats: u64) -> String {
    format!("{}.{:08}", sats / SATS_PER_BTC, sats % SATS_PER_BTC)
}

/// Convert satoshis to human-readable string
/// e.g., 100000 -> "100,000 sats (0.00100000 BTC)"
pub fn sats_to_display(sats: u64) -> String {
    format!(
        "{} sats ({} BTC)",
        format_with_commas(sats),
        sats_to_btc_string(sats)
    )
}

/// Format number with thousands separators
fn format_with_commas(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}

/// Parse a satoshi amount, accepting `,` and `_` separators
pub fn parse_sats(s: &str) -> Result<u64, AmountError> {
    s.trim()
        .replace([',', '_'], "")
        .parse()
        .map_err(|_| AmountError::Unparseable(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sats_to_btc() {
        assert_eq!(sats_to_btc_string(0), "0.00000000");
        assert_eq!(sats_to_btc_string(1), "0.00000001");
        assert_eq!(sats_to_btc_string(100_000_000), "1.00000000");
        assert_eq!(sats_to_btc_string(123_456_789), "1.23456789");
    }

    #[test]
    fn test_display_format() {
        let display = sats_to_display(1_000_000);
        assert!(display.contains("1,000,000"));
        assert!(display.contains("0.01000000 BTC"));
    }

    #[test]
    fn test_validate_amount() {
        assert_eq!(validate_amount(0), Err(AmountError::Zero));
        assert_eq!(validate_amount(6_000), Ok(6_000));
        assert!(validate_amount(MAX_MONEY_SATS + 1).is_err());
        assert!(amount_from_contract(u128::MAX).is_err());
        assert_eq!(amount_from_contract(5_000), Ok(5_000));
    }

    #[test]
    fn test_parse_sats() {
        assert_eq!(parse_sats("1000"), Ok(1000));
        assert_eq!(parse_sats("1,000,000"), Ok(1_000_000));
        assert_eq!(parse_sats("1_000_000"), Ok(1_000_000));
        assert_eq!(parse_sats("  42  "), Ok(42));
        assert!(parse_sats("invalid").is_err());
    }
}
