//! BTC Transaction Builder
//!
//! Builds unsigned redeem transactions: payout, optional change back to the
//! vault, and a zero-value data output carrying the redeem id.

use bitcoin::{
    absolute::LockTime,
    script::PushBytesBuf,
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness, WitnessProgram, WitnessVersion,
};
use std::str::FromStr;

use super::{FreeOutput, WalletError};
use crate::types::RequestId;

/// Outputs below this value are not created
pub const DUST_LIMIT_SATS: u64 = 546;

/// Parse a request-side BTC address: bech32, or `0x` hex of a v0 20-byte program
pub fn parse_btc_address(value: &str, network: Network) -> Result<Address, WalletError> {
    let value = value.trim();

    if let Some(digits) = value.strip_prefix("0x") {
        let program = hex::decode(digits).map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        if program.len() != 20 {
            return Err(WalletError::InvalidAddress(format!(
                "expected a 20-byte witness program, got {} bytes",
                program.len()
            )));
        }
        let program = WitnessProgram::new(WitnessVersion::V0, &program)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        return Ok(Address::from_witness_program(program, network));
    }

    Address::from_str(value)
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))?
        .require_network(network)
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))
}

/// Data output carrying the 32-byte redeem id
pub fn embed_output(id: &RequestId) -> Result<TxOut, WalletError> {
    let data = PushBytesBuf::try_from(id.as_bytes().to_vec())
        .map_err(|e| WalletError::Build(e.to_string()))?;

    Ok(TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(&data),
    })
}

/// Builds unsigned redeem transactions
pub struct TxBuilder {
    network: Network,
    dust_limit: u64,
}

impl TxBuilder {
    pub fn new(network: Network, dust_limit: u64) -> Self {
        Self {
            network,
            dust_limit,
        }
    }

    /// Build the redeem transaction spending `inputs`
    ///
    /// Change goes to the address of the first selected output.
    pub fn build_redeem(
        &self,
        inputs: &[FreeOutput],
        amount: u64,
        fee: u64,
        recipient: &str,
        redeem_id: &RequestId,
    ) -> Result<UnsignedTx, WalletError> {
        let first = inputs.first().ok_or(WalletError::NoOutputs)?;

        if amount < self.dust_limit {
            return Err(WalletError::InvalidAmount(format!(
                "payout of {} sats is below the dust limit of {} sats",
                amount, self.dust_limit
            )));
        }

        let required = amount
            .checked_add(fee)
            .ok_or_else(|| WalletError::InvalidAmount("amount + fee overflows".into()))?;
        let total_input: u64 = inputs.iter().map(|o| o.value_sats).sum();

        if total_input < required {
            return Err(WalletError::InsufficientFunds {
                required,
                available: total_input,
            });
        }

        let recipient_address = parse_btc_address(recipient, self.network)?;
        let change_address = parse_btc_address(&first.owning_address, self.network)?;

        let tx_inputs = inputs
            .iter()
            .map(|output| {
                let txid = Txid::from_str(&output.tx_hash)
                    .map_err(|e| WalletError::Build(format!("invalid txid: {}", e)))?;

                Ok(TxIn {
                    previous_output: OutPoint {
                        txid,
                        vout: output.output_index,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;

        let change = total_input - required;

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: recipient_address.script_pubkey(),
        }];

        if change >= self.dust_limit {
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_address.script_pubkey(),
            });
        }

        outputs.push(embed_output(redeem_id)?);

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: outputs,
        };

        Ok(UnsignedTx {
            tx,
            inputs: inputs.to_vec(),
            fee,
            amount,
            change: if change >= self.dust_limit { change } else { 0 },
            change_address: change_address.to_string(),
            recipient: recipient_address.to_string(),
        })
    }
}

/// Unsigned transaction ready for signing
#[derive(Debug, Clone)]
pub struct UnsignedTx {
    pub tx: Transaction,
    /// Outputs being spent, in input order
    pub inputs: Vec<FreeOutput>,
    pub fee: u64,
    pub amount: u64,
    /// Change value (0 when folded into the fee as dust)
    pub change: u64,
    pub change_address: String,
    pub recipient: String,
}
