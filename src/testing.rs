//! In-memory Bitcoin network and wallet fixtures for unit tests

use async_trait::async_trait;
use bitcoin::{address::NetworkUnchecked, Address, Network, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bitcoin::{BitcoinNetwork, ChainTx, ChainTxInput, ChainTxOutput, EsploraError};
use crate::common::config::MasterSecret;
use crate::storage::{MemoryStore, RequestStore};
use crate::types::{BridgeRequest, RequestId, RequestKind, RequestStatus};
use crate::wallet::{KeyDeriver, WalletBtc, WalletSettings};

pub const TEST_VAULT: &str = "0xvault";

#[derive(Default)]
struct ChainState {
    txs: Vec<ChainTx>,
    /// txid -> poll count at which the tx becomes visible
    visible_at: HashMap<String, u64>,
    polls: u64,
    tip: u64,
    next_funding: u64,
    broadcasts: Vec<String>,
    fail_broadcasts: u32,
    accept_then_fail: u32,
    fail_fee: u32,
    fail_history: u32,
}

/// Chain double: address histories built from funding and broadcast txs
pub struct FakeChain {
    fee: u64,
    visibility_delay: u64,
    network: Network,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(fee: u64) -> Self {
        Self {
            fee,
            visibility_delay: 0,
            network: Network::Testnet,
            state: Mutex::new(ChainState {
                tip: 100,
                ..ChainState::default()
            }),
        }
    }

    /// Broadcast txs show up only after `polls` history reads
    pub fn with_visibility_delay(mut self, polls: u64) -> Self {
        self.visibility_delay = polls;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pay `value` to `address` in a confirmed funding tx
    pub fn fund(&self, address: &str, value: u64) -> String {
        let mut state = self.state();
        state.next_funding += 1;
        let txid = format!("{:064x}", 0xf0_0000 + state.next_funding);
        let height = state.tip;
        let script_hex = address
            .parse::<Address<NetworkUnchecked>>()
            .map(|a| hex::encode(a.assume_checked().script_pubkey().as_bytes()))
            .unwrap_or_default();
        state.txs.push(ChainTx {
            txid: txid.clone(),
            inputs: vec![],
            outputs: vec![ChainTxOutput {
                script_hex,
                address: Some(address.to_string()),
                value,
            }],
            confirmed: true,
            block_height: Some(height),
        });
        txid
    }

    /// Confirm everything in one new block
    pub fn mine(&self) {
        let mut state = self.state();
        state.tip += 1;
        let tip = state.tip;
        for tx in state.txs.iter_mut().filter(|t| !t.confirmed) {
            tx.confirmed = true;
            tx.block_height = Some(tip);
        }
    }

    pub fn fail_next_broadcasts(&self, n: u32) {
        self.state().fail_broadcasts = n;
    }

    /// Accept the next `n` broadcasts but report an error
    pub fn accept_then_fail_broadcasts(&self, n: u32) {
        self.state().accept_then_fail = n;
    }

    pub fn fail_next_fee_queries(&self, n: u32) {
        self.state().fail_fee = n;
    }

    pub fn fail_next_history_reads(&self, n: u32) {
        self.state().fail_history = n;
    }

    pub fn broadcast_count(&self) -> usize {
        self.state().broadcasts.len()
    }

    pub fn transaction(&self, txid: &str) -> Option<ChainTx> {
        self.state().txs.iter().find(|t| t.txid == txid).cloned()
    }

    fn to_chain_tx(&self, tx: &Transaction) -> ChainTx {
        ChainTx {
            txid: tx.compute_txid().to_string(),
            inputs: tx
                .input
                .iter()
                .map(|i| ChainTxInput {
                    prev_txid: i.previous_output.txid.to_string(),
                    prev_vout: i.previous_output.vout,
                })
                .collect(),
            outputs: tx
                .output
                .iter()
                .map(|o| ChainTxOutput {
                    script_hex: hex::encode(o.script_pubkey.as_bytes()),
                    address: Address::from_script(&o.script_pubkey, self.network)
                        .ok()
                        .map(|a| a.to_string()),
                    value: o.value.to_sat(),
                })
                .collect(),
            confirmed: false,
            block_height: None,
        }
    }
}

fn touches(state: &ChainState, tx: &ChainTx, address: &str) -> bool {
    if tx.outputs.iter().any(|o| o.address.as_deref() == Some(address)) {
        return true;
    }
    tx.inputs.iter().any(|input| {
        state
            .txs
            .iter()
            .find(|prev| prev.txid == input.prev_txid)
            .and_then(|prev| prev.outputs.get(input.prev_vout as usize))
            .map(|o| o.address.as_deref() == Some(address))
            .unwrap_or(false)
    })
}

#[async_trait]
impl BitcoinNetwork for FakeChain {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ChainTx>, EsploraError> {
        let mut state = self.state();
        if state.fail_history > 0 {
            state.fail_history -= 1;
            return Err(EsploraError::AddressNotFound(address.to_string()));
        }
        state.polls += 1;
        let polls = state.polls;

        Ok(state
            .txs
            .iter()
            .filter(|tx| state.visible_at.get(&tx.txid).map_or(true, |at| polls >= *at))
            .filter(|tx| touches(&state, tx, address))
            .cloned()
            .collect())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError> {
        let bytes = hex::decode(tx_hex).map_err(|e| EsploraError::ParseError(e.to_string()))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| EsploraError::ParseError(e.to_string()))?;
        let chain_tx = self.to_chain_tx(&tx);

        let mut state = self.state();
        if state.fail_broadcasts > 0 {
            state.fail_broadcasts -= 1;
            return Err(EsploraError::BroadcastFailed("connection reset".into()));
        }

        if state.txs.iter().any(|t| t.txid == chain_tx.txid) {
            return Ok(chain_tx.txid);
        }

        let conflict = chain_tx.inputs.iter().any(|input| {
            state
                .txs
                .iter()
                .any(|t| t.spends(&input.prev_txid, input.prev_vout))
        });
        if conflict {
            return Err(EsploraError::BroadcastFailed(
                "bad-txns-inputs-missingorspent".into(),
            ));
        }

        let txid = chain_tx.txid.clone();
        let visible_at = state.polls + self.visibility_delay;
        state.visible_at.insert(txid.clone(), visible_at);
        state.broadcasts.push(tx_hex.to_string());
        state.txs.push(chain_tx);

        if state.accept_then_fail > 0 {
            state.accept_then_fail -= 1;
            return Err(EsploraError::BroadcastFailed("timeout".into()));
        }

        Ok(txid)
    }

    async fn network_fee(&self) -> Result<u64, EsploraError> {
        let mut state = self.state();
        if state.fail_fee > 0 {
            state.fail_fee -= 1;
            return Err(EsploraError::ParseError("fee estimates unavailable".into()));
        }
        Ok(self.fee)
    }

    async fn tip_height(&self) -> Result<u64, EsploraError> {
        Ok(self.state().tip)
    }
}

/// Wallet wired to a fake chain and memory store, funded through issue records
pub struct TestVault {
    pub chain: Arc<FakeChain>,
    pub store: Arc<MemoryStore>,
    pub deriver: Arc<KeyDeriver>,
    pub wallet: Arc<WalletBtc>,
}

impl TestVault {
    /// Issues 1..=n funded with `amounts`, opened in that order
    pub async fn with_issues(amounts: &[u64]) -> Self {
        Self::with_parts(
            Arc::new(FakeChain::new(500)),
            Arc::new(MemoryStore::new()),
            amounts,
        )
        .await
    }

    pub async fn with_parts(chain: Arc<FakeChain>, store: Arc<MemoryStore>, amounts: &[u64]) -> Self {
        let deriver = Arc::new(KeyDeriver::new(
            MasterSecret::from_bytes([0x11; 32]),
            Network::Testnet,
        ));

        for (index, amount) in amounts.iter().enumerate() {
            let id = RequestId::from_u64(index as u64 + 1);
            let address = deriver.deposit_address(&id).to_string();
            let funding_tx = chain.fund(&address, *amount);

            store
                .upsert_request(&BridgeRequest {
                    kind: RequestKind::Issue,
                    id,
                    requester: "0xdepositor".into(),
                    vault: TEST_VAULT.into(),
                    btc_address: address,
                    amount: *amount,
                    status: RequestStatus::Completed,
                    btc_tx: Some(funding_tx),
                    opentime: index as u64 + 1,
                    last_update: index as u64 + 1,
                })
                .await
                .expect("memory store accepts requests");
        }

        let settings = WalletSettings {
            settle_delay: Duration::ZERO,
            ..WalletSettings::default()
        };
        let wallet = Arc::new(WalletBtc::new(
            TEST_VAULT,
            settings,
            deriver.clone(),
            chain.clone(),
            store.clone(),
        ));

        Self {
            chain,
            store,
            deriver,
            wallet,
        }
    }

    /// A user address outside the vault
    pub fn recipient(&self) -> String {
        KeyDeriver::new(MasterSecret::from_bytes([0x42; 32]), Network::Testnet)
            .deposit_address(&RequestId::from_u64(0))
            .to_string()
    }

    pub fn funding_address(&self, n: u64) -> String {
        self.deriver
            .deposit_address(&RequestId::from_u64(n))
            .to_string()
    }
}
