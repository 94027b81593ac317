//! Transaction Signer
//!
//! Signs redeem transactions input by input with the key derived from each
//! input's funding id (P2WPKH, ECDSA, SIGHASH_ALL).

use bitcoin::{
    ecdsa,
    hashes::Hash,
    secp256k1::Message,
    sighash::{EcdsaSighashType, SighashCache},
    Amount, ScriptBuf, Transaction, Witness,
};
use std::sync::Arc;

use super::builder::UnsignedTx;
use super::derivation::KeyDeriver;
use super::WalletError;

/// Trait for transaction signers
pub trait TxSigner: Send + Sync {
    /// Sign every input of an unsigned transaction
    fn sign(&self, unsigned: &UnsignedTx) -> Result<Transaction, WalletError>;

    /// Get signer type description
    fn signer_type(&self) -> &'static str;
}

/// Signs with keys derived per funding id
pub struct DerivedKeySigner {
    deriver: Arc<KeyDeriver>,
}

impl DerivedKeySigner {
    pub fn new(deriver: Arc<KeyDeriver>) -> Self {
        Self { deriver }
    }
}

impl TxSigner for DerivedKeySigner {
    fn sign(&self, unsigned: &UnsignedTx) -> Result<Transaction, WalletError> {
        if unsigned.inputs.len() != unsigned.tx.input.len() {
            return Err(WalletError::Signing(format!(
                "{} inputs but {} spend records",
                unsigned.tx.input.len(),
                unsigned.inputs.len()
            )));
        }

        let secp = self.deriver.secp();
        let mut witnesses = Vec::with_capacity(unsigned.inputs.len());

        {
            let mut cache = SighashCache::new(&unsigned.tx);

            for (index, spent) in unsigned.inputs.iter().enumerate() {
                let key = self.deriver.derive(&spent.funding_id);
                let script_pubkey = ScriptBuf::from_bytes(
                    hex::decode(&spent.script_hex)
                        .map_err(|e| WalletError::Signing(e.to_string()))?,
                );

                if key.script_pubkey() != script_pubkey {
                    return Err(WalletError::Signing(format!(
                        "derived key for {} does not control {}:{}",
                        spent.funding_id, spent.tx_hash, spent.output_index
                    )));
                }

                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &script_pubkey,
                        Amount::from_sat(spent.value_sats),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| WalletError::Signing(e.to_string()))?;

                let message = Message::from_digest(sighash.to_byte_array());
                let signature = ecdsa::Signature {
                    signature: secp.sign_ecdsa(&message, &key.secret),
                    sighash_type: EcdsaSighashType::All,
                };

                witnesses.push(Witness::p2wpkh(&signature, &key.public));
            }
        }

        let mut tx = unsigned.tx.clone();
        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        Ok(tx)
    }

    fn signer_type(&self) -> &'static str {
        "derived-key"
    }
}
