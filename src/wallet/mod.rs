//! Vault BTC Wallet
//!
//! UTXO engine over the vault's deposit addresses:
//! - free output discovery from issue records and chain history
//! - selection with an in-memory reservation set
//! - a per-vault spend lock held from selection through broadcast
//! - redeem transaction building, signing, broadcast and search by content

pub mod builder;
pub mod derivation;
pub mod outputs;
pub mod signer;

use bitcoin::{consensus::encode::serialize_hex, Network, Transaction};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bitcoin::{BitcoinNetwork, ChainTx, EsploraError};
use crate::storage::{RequestStore, StorageError};
use crate::types::RequestId;

pub use builder::{embed_output, parse_btc_address, TxBuilder, UnsignedTx, DUST_LIMIT_SATS};
pub use derivation::{DerivedKey, KeyDeriver, MasterPublicKey};
pub use outputs::{outpoint_key, unspent_outputs, Accumulator, FreeOutput};
pub use signer::{DerivedKeySigner, TxSigner};

/// Issues scanned per store page
pub const DEFAULT_ISSUE_PAGE_SIZE: usize = 100_000;

/// Wallet errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Vault BTC balance is too low: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("network error: {0}")]
    Network(#[from] EsploraError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("broadcast unconfirmed: {0}")]
    BroadcastUnconfirmed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("transaction build failed: {0}")]
    Build(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("no outputs selected")]
    NoOutputs,
}

/// Wallet settings
#[derive(Debug, Clone)]
pub struct WalletSettings {
    pub network: Network,
    /// Wait after a broadcast before the first search
    pub settle_delay: Duration,
    pub issue_page_size: usize,
    pub dust_limit: u64,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            settle_delay: Duration::from_millis(2000),
            issue_page_size: DEFAULT_ISSUE_PAGE_SIZE,
            dust_limit: DUST_LIMIT_SATS,
        }
    }
}

/// Outcome of [`WalletBtc::build_and_send`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    /// True once the transaction was found on chain or in the mempool
    pub status: bool,
    pub transaction_hash: Option<String>,
}

/// The vault's BTC wallet
pub struct WalletBtc {
    vault: String,
    settings: WalletSettings,
    deriver: Arc<KeyDeriver>,
    network: Arc<dyn BitcoinNetwork>,
    requests: Arc<dyn RequestStore>,
    builder: TxBuilder,
    signer: Arc<dyn TxSigner>,
    /// Outpoints held by in-flight operations
    reservations: Mutex<HashSet<String>>,
    spend_lock: Arc<Mutex<()>>,
}

impl WalletBtc {
    pub fn new(
        vault: &str,
        settings: WalletSettings,
        deriver: Arc<KeyDeriver>,
        network: Arc<dyn BitcoinNetwork>,
        requests: Arc<dyn RequestStore>,
    ) -> Self {
        let builder = TxBuilder::new(settings.network, settings.dust_limit);
        let signer = Arc::new(DerivedKeySigner::new(deriver.clone()));

        Self {
            vault: vault.to_string(),
            settings,
            deriver,
            network,
            requests,
            builder,
            signer,
            reservations: Mutex::new(HashSet::new()),
            spend_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn settings(&self) -> &WalletSettings {
        &self.settings
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Spendable balance per deposit address
    pub async fn get_balances(&self) -> Result<BTreeMap<String, u64>, WalletError> {
        let outputs = self.get_free_outputs(0, true).await?;

        let mut balances = BTreeMap::new();
        for output in outputs {
            *balances.entry(output.owning_address).or_insert(0) += output.value_sats;
        }
        Ok(balances)
    }

    /// Free outputs covering `amount` (or all of them in max mode); reserves nothing
    pub async fn get_free_outputs(
        &self,
        amount: u64,
        max_mode: bool,
    ) -> Result<Vec<FreeOutput>, WalletError> {
        let reserved = self.reservations.lock().await.clone();
        self.scan(amount, max_mode, &reserved).await
    }

    async fn scan(
        &self,
        amount: u64,
        max_mode: bool,
        reserved: &HashSet<String>,
    ) -> Result<Vec<FreeOutput>, WalletError> {
        let mut acc = Accumulator::new(amount, max_mode);
        let mut page = 0;

        'pages: loop {
            let issues = self
                .requests
                .issues_for_vault(&self.vault, page, self.settings.issue_page_size)
                .await?;

            for issue in &issues.content {
                let address = self.deriver.deposit_address(&issue.id).to_string();
                if !self.recorded_address_matches(&issue.btc_address, &address) {
                    warn!(
                        target: "vault::wallet",
                        funding_id = %issue.id,
                        recorded = %issue.btc_address,
                        derived = %address,
                        "Issue address does not match its derived key, skipping"
                    );
                    continue;
                }
                let history = self.network.address_transactions(&address).await?;

                for output in unspent_outputs(&history, &address, &issue.id) {
                    if reserved.contains(&output.outpoint()) {
                        continue;
                    }
                    if acc.push(output) {
                        break 'pages;
                    }
                }
            }

            page += 1;
            if issues.content.is_empty() || page as u64 >= issues.total_pages {
                break;
            }
        }

        if max_mode || acc.is_satisfied() {
            return Ok(acc.into_outputs());
        }

        Err(WalletError::InsufficientFunds {
            required: amount,
            available: acc.total(),
        })
    }

    fn recorded_address_matches(&self, recorded: &str, derived: &str) -> bool {
        parse_btc_address(recorded, self.settings.network)
            .map(|address| address.to_string() == derived)
            .unwrap_or(false)
    }

    /// Select and reserve outputs covering `amount`
    pub async fn select_outputs(&self, amount: u64) -> Result<Vec<FreeOutput>, WalletError> {
        let mut reservations = self.reservations.lock().await;
        let outputs = self.scan(amount, false, &reservations).await?;

        for output in &outputs {
            reservations.insert(output.outpoint());
        }

        debug!(
            target: "vault::wallet",
            count = outputs.len(),
            total = outputs.iter().map(|o| o.value_sats).sum::<u64>(),
            "Reserved outputs"
        );
        Ok(outputs)
    }

    /// Drop reservations for `outputs`
    pub async fn release(&self, outputs: &[FreeOutput]) {
        let mut reservations = self.reservations.lock().await;
        for output in outputs {
            reservations.remove(&output.outpoint());
        }
    }

    /// Reserve the inputs of an already signed transaction
    pub async fn reserve_inputs(&self, tx: &Transaction) {
        let mut reservations = self.reservations.lock().await;
        for input in &tx.input {
            let prev = input.previous_output;
            reservations.insert(outpoint_key(&prev.txid.to_string(), prev.vout));
        }
    }

    pub async fn release_inputs(&self, tx: &Transaction) {
        let mut reservations = self.reservations.lock().await;
        for input in &tx.input {
            let prev = input.previous_output;
            reservations.remove(&outpoint_key(&prev.txid.to_string(), prev.vout));
        }
    }

    pub async fn reserved_count(&self) -> usize {
        self.reservations.lock().await.len()
    }

    /// Single-flight guard held from selection through broadcast
    pub async fn lock_vault(&self) -> OwnedMutexGuard<()> {
        self.spend_lock.clone().lock_owned().await
    }

    /// Flat fee for the next transaction
    pub async fn network_fee(&self) -> Result<u64, WalletError> {
        Ok(self.network.network_fee().await?)
    }

    pub async fn tip_height(&self) -> Result<u64, WalletError> {
        Ok(self.network.tip_height().await?)
    }

    pub fn build_transaction(
        &self,
        outputs: &[FreeOutput],
        amount: u64,
        fee: u64,
        to: &str,
        redeem_id: &RequestId,
    ) -> Result<UnsignedTx, WalletError> {
        self.builder.build_redeem(outputs, amount, fee, to, redeem_id)
    }

    pub fn sign_transaction(&self, unsigned: &UnsignedTx) -> Result<Transaction, WalletError> {
        self.signer.sign(unsigned)
    }

    /// Broadcast a signed transaction; any failure is treated as ambiguous
    pub async fn broadcast(&self, tx: &Transaction) -> Result<String, WalletError> {
        let txid = tx.compute_txid().to_string();

        match self.network.broadcast(&serialize_hex(tx)).await {
            Ok(accepted) => {
                if accepted != txid {
                    warn!(
                        target: "vault::wallet",
                        expected = %txid,
                        returned = %accepted,
                        "Broadcast returned a different txid"
                    );
                }
                info!(target: "vault::wallet", txid = %txid, "Transaction broadcast");
                Ok(txid)
            }
            Err(e) => Err(WalletError::BroadcastUnconfirmed(format!("{}: {}", txid, e))),
        }
    }

    /// Search `address` history for a tx by txid, else by the redeem id embed
    pub async fn find_transaction(
        &self,
        address: &str,
        txid: Option<&str>,
        redeem_id: &RequestId,
    ) -> Result<Option<ChainTx>, WalletError> {
        let history = self.network.address_transactions(address).await?;

        if let Some(txid) = txid {
            if let Some(tx) = history.iter().find(|tx| tx.txid == txid) {
                return Ok(Some(tx.clone()));
            }
        }

        Ok(history.into_iter().find(|tx| tx.embeds(redeem_id)))
    }

    /// Search a recipient's history for a payout embedding `redeem_id`
    pub async fn find_redeem_transaction(
        &self,
        recipient: &str,
        redeem_id: &RequestId,
    ) -> Result<Option<ChainTx>, WalletError> {
        let address = parse_btc_address(recipient, self.settings.network)?.to_string();
        self.find_transaction(&address, None, redeem_id).await
    }

    /// Select, build, sign, broadcast and look for the result at the change address
    ///
    /// Reservations are kept when the transaction is not found yet.
    pub async fn build_and_send(
        &self,
        amount: u64,
        to: &str,
        redeem_id: &RequestId,
    ) -> Result<SendResult, WalletError> {
        let (unsigned, txid) = {
            let _guard = self.lock_vault().await;

            let fee = self.network_fee().await?;
            let required = amount
                .checked_add(fee)
                .ok_or_else(|| WalletError::InvalidAmount("amount + fee overflows".into()))?;
            let outputs = self.select_outputs(required).await?;

            let prepared = self
                .build_transaction(&outputs, amount, fee, to, redeem_id)
                .and_then(|unsigned| {
                    let signed = self.sign_transaction(&unsigned)?;
                    Ok((unsigned, signed))
                });
            let (unsigned, signed) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.release(&outputs).await;
                    return Err(e);
                }
            };

            let txid = match self.broadcast(&signed).await {
                Ok(txid) => txid,
                Err(e) => {
                    warn!(target: "vault::wallet", error = %e, "Broadcast outcome unknown");
                    signed.compute_txid().to_string()
                }
            };
            (unsigned, txid)
        };

        tokio::time::sleep(self.settings.settle_delay).await;

        let found = self
            .find_transaction(&unsigned.change_address, Some(&txid), redeem_id)
            .await?;

        match found {
            Some(tx) => {
                self.release(&unsigned.inputs).await;
                Ok(SendResult {
                    status: true,
                    transaction_hash: Some(tx.txid),
                })
            }
            None => Ok(SendResult {
                status: false,
                transaction_hash: None,
            }),
        }
    }
}
