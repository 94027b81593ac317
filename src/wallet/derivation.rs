//! Per-deposit key derivation
//!
//! Every funding (issue) request gets its own key, derived from the vault
//! master secret and the request id alone. No key material is stored.

use bitcoin::hashes::{sha256, Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network, ScriptBuf};

use super::WalletError;
use crate::common::config::MasterSecret;
use crate::types::RequestId;

/// Domain separation tag for deposit keys
const DEPOSIT_KEY_TAG: &[u8] = b"vault-client/deposit-key/v1";

/// Key material for one funding id
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub secret: SecretKey,
    pub public: PublicKey,
    /// P2WPKH address the depositor pays to
    pub address: Address,
}

impl DerivedKey {
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}

/// Uncompressed master public key split into coordinates (`0x` hex)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPublicKey {
    pub x: String,
    pub y: String,
}

/// Derives deposit keys from the vault master secret
pub struct KeyDeriver {
    master: MasterSecret,
    network: Network,
    secp: Secp256k1<secp256k1::All>,
}

impl KeyDeriver {
    pub fn new(master: MasterSecret, network: Network) -> Self {
        Self {
            master,
            network,
            secp: Secp256k1::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// HMAC-SHA256(master, tag || id [|| counter]) until it is a valid scalar
    pub fn derive(&self, funding_id: &RequestId) -> DerivedKey {
        let mut counter: u32 = 0;
        let secret = loop {
            let mut engine = HmacEngine::<sha256::Hash>::new(self.master.as_bytes());
            engine.input(DEPOSIT_KEY_TAG);
            engine.input(funding_id.as_bytes());
            if counter > 0 {
                engine.input(&counter.to_be_bytes());
            }
            let digest = Hmac::<sha256::Hash>::from_engine(engine);

            // Zero or >= curve order, probability ~2^-128
            match SecretKey::from_slice(digest.as_byte_array()) {
                Ok(secret) => break secret,
                Err(_) => counter += 1,
            }
        };

        let public = secret.public_key(&self.secp);
        let address = Address::p2wpkh(&CompressedPublicKey(public), self.network);

        DerivedKey {
            secret,
            public,
            address,
        }
    }

    /// Deposit address handed out for an issue request
    pub fn deposit_address(&self, funding_id: &RequestId) -> Address {
        self.derive(funding_id).address
    }

    /// Public key registered with the contract
    pub fn master_public_key(&self) -> Result<MasterPublicKey, WalletError> {
        let secret = SecretKey::from_slice(self.master.as_bytes())
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        let uncompressed = secret.public_key(&self.secp).serialize_uncompressed();

        Ok(MasterPublicKey {
            x: format!("0x{}", hex::encode(&uncompressed[1..33])),
            y: format!("0x{}", hex::encode(&uncompressed[33..65])),
        })
    }

    pub(crate) fn secp(&self) -> &Secp256k1<secp256k1::All> {
        &self.secp
    }
}
