//! Free output discovery
//!
//! A free output is an output paying a vault deposit address that no
//! transaction in that address's history spends. Nothing here is persisted;
//! outputs are recomputed from chain state on every scan.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::bitcoin::ChainTx;
use crate::types::RequestId;

/// Unspent output controlled by the vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeOutput {
    pub tx_hash: String,
    pub output_index: u32,
    pub value_sats: u64,
    pub script_hex: String,
    /// Issue request whose derived key controls the output
    pub funding_id: RequestId,
    pub owning_address: String,
}

impl FreeOutput {
    /// Outpoint key used by the reservation set
    pub fn outpoint(&self) -> String {
        outpoint_key(&self.tx_hash, self.output_index)
    }
}

pub fn outpoint_key(txid: &str, vout: u32) -> String {
    format!("{}:{}", txid, vout)
}

/// Unspent outputs paying `address` within its own history
pub fn unspent_outputs(
    history: &[ChainTx],
    address: &str,
    funding_id: &RequestId,
) -> Vec<FreeOutput> {
    let spent: HashSet<String> = history
        .iter()
        .flat_map(|tx| tx.inputs.iter())
        .map(|input| outpoint_key(&input.prev_txid, input.prev_vout))
        .collect();

    let mut seen = HashSet::new();
    let mut outputs = Vec::new();

    for tx in history {
        // Mempool and confirmed views can both list the same tx
        if !seen.insert(tx.txid.as_str()) {
            continue;
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            if output.address.as_deref() != Some(address) || output.value == 0 {
                continue;
            }
            let index = index as u32;
            if spent.contains(&outpoint_key(&tx.txid, index)) {
                continue;
            }
            outputs.push(FreeOutput {
                tx_hash: tx.txid.clone(),
                output_index: index,
                value_sats: output.value,
                script_hex: output.script_hex.clone(),
                funding_id: *funding_id,
                owning_address: address.to_string(),
            });
        }
    }

    outputs
}

/// Running selection over candidate outputs
#[derive(Debug, Default)]
pub struct Accumulator {
    target: u64,
    max_mode: bool,
    total: u64,
    outputs: Vec<FreeOutput>,
    seen: HashSet<String>,
}

impl Accumulator {
    pub fn new(target: u64, max_mode: bool) -> Self {
        Self {
            target,
            max_mode,
            ..Self::default()
        }
    }

    /// Add a candidate; returns true once the target is met (never in max mode)
    pub fn push(&mut self, output: FreeOutput) -> bool {
        if self.is_satisfied() {
            return true;
        }
        if self.seen.insert(output.outpoint()) {
            self.total += output.value_sats;
            self.outputs.push(output);
        }
        self.is_satisfied()
    }

    pub fn is_satisfied(&self) -> bool {
        !self.max_mode && self.total >= self.target
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn into_outputs(self) -> Vec<FreeOutput> {
        self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::{ChainTxInput, ChainTxOutput};

    fn pay(txid: &str, to: &str, value: u64, spends: Option<(&str, u32)>) -> ChainTx {
        ChainTx {
            txid: txid.to_string(),
            inputs: spends
                .map(|(t, v)| {
                    vec![ChainTxInput {
                        prev_txid: t.to_string(),
                        prev_vout: v,
                    }]
                })
                .unwrap_or_default(),
            outputs: vec![ChainTxOutput {
                script_hex: "0014".into(),
                address: Some(to.to_string()),
                value,
            }],
            confirmed: true,
            block_height: Some(1),
        }
    }

    fn free(tx: &str, value: u64) -> FreeOutput {
        FreeOutput {
            tx_hash: tx.into(),
            output_index: 0,
            value_sats: value,
            script_hex: String::new(),
            funding_id: RequestId::from_u64(1),
            owning_address: "a".into(),
        }
    }

    #[test]
    fn test_spent_outputs_are_excluded() {
        let id = RequestId::from_u64(1);
        let history = vec![
            pay("t1", "addr", 5_000, None),
            pay("t2", "addr", 3_000, None),
            pay("t3", "elsewhere", 4_900, Some(("t1", 0))),
        ];

        let outputs = unspent_outputs(&history, "addr", &id);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].tx_hash, "t2");
        assert_eq!(outputs[0].funding_id, id);
    }

    #[test]
    fn test_duplicate_history_entries() {
        let tx = pay("t1", "addr", 5_000, None);
        let outputs = unspent_outputs(&[tx.clone(), tx], "addr", &RequestId::from_u64(1));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_accumulator_stops_at_threshold() {
        let mut acc = Accumulator::new(6_500, false);
        assert!(!acc.push(free("i1", 5_000)));
        assert!(acc.push(free("i2", 3_000)));
        assert!(acc.push(free("i3", 2_000)));

        assert_eq!(acc.total(), 8_000);
        assert_eq!(acc.into_outputs().len(), 2);
    }

    #[test]
    fn test_accumulator_max_mode_takes_everything() {
        let mut acc = Accumulator::new(0, true);
        for (tx, value) in [("a", 1), ("b", 2), ("c", 3)] {
            assert!(!acc.push(free(tx, value)));
        }
        assert_eq!(acc.total(), 6);
    }
}
