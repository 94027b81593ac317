//! Bridge Contract Collaborator
//!
//! The vault never talks to the contract chain directly. It goes through
//! [`BridgeContract`], implemented here by a JSON gateway that signs and
//! submits contract calls on the vault's behalf.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{BridgeRequest, RequestId, RequestKind, RequestStatus};

/// Contract gateway errors
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("contract call rejected: {0}")]
    Rejected(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

/// Receipt of a submitted contract transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub status: bool,
}

/// Vault entry as stored in the contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainVault {
    pub registered: bool,
    /// Contract-defined status code
    pub status: String,
    /// Locked collateral, decimal string (uint256)
    pub collateral: String,
    pub pub_x: Option<String>,
    pub pub_y: Option<String>,
}

/// Contract operations the vault depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeContract: Send + Sync {
    /// Address the vault acts as on the contract chain
    fn vault_address(&self) -> String;

    async fn vault_info(&self) -> Result<OnChainVault, ContractError>;

    /// Register the vault with its collateral and uncompressed master public key
    async fn register(
        &self,
        collateral: u128,
        pub_x: String,
        pub_y: String,
    ) -> Result<TxReceipt, ContractError>;

    async fn issue_status(&self, id: RequestId) -> Result<RequestStatus, ContractError>;

    async fn redeem_status(&self, id: RequestId) -> Result<RequestStatus, ContractError>;

    /// Requests of `kind` assigned to the vault and opened at or after `since`
    async fn requests(
        &self,
        kind: RequestKind,
        since: u64,
    ) -> Result<Vec<BridgeRequest>, ContractError>;

    /// Report the BTC transaction that paid out a redeem
    async fn notify_redeem_complete(
        &self,
        id: RequestId,
        btc_txid: String,
    ) -> Result<TxReceipt, ContractError>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: RequestStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    vault: &'a str,
    collateral: String,
    pub_x: &'a str,
    pub_y: &'a str,
    gas: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRedeemBody<'a> {
    vault: &'a str,
    btc_tx: &'a str,
    gas: u64,
}

/// JSON gateway in front of the bridge contract
#[derive(Debug, Clone)]
pub struct HttpContractGateway {
    client: Client,
    base_url: String,
    vault: String,
    gas_limit: u64,
}

impl HttpContractGateway {
    pub fn new(base_url: &str, vault: &str, gas_limit: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            vault: vault.to_string(),
            gas_limit,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ContractError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ContractError::InvalidResponse(format!("{}: {}", status, body)));
        }

        Ok(resp.json().await?)
    }

    async fn submit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<TxReceipt, ContractError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ContractError::Rejected(body));
        }

        let receipt: TxReceipt = resp.json().await?;
        if !receipt.status {
            return Err(ContractError::Rejected(format!(
                "transaction {} reverted",
                receipt.transaction_hash
            )));
        }

        Ok(receipt)
    }
}

#[async_trait]
impl BridgeContract for HttpContractGateway {
    fn vault_address(&self) -> String {
        self.vault.clone()
    }

    async fn vault_info(&self) -> Result<OnChainVault, ContractError> {
        self.get_json(&format!("/vaults/{}", self.vault)).await
    }

    async fn register(
        &self,
        collateral: u128,
        pub_x: String,
        pub_y: String,
    ) -> Result<TxReceipt, ContractError> {
        let body = RegisterBody {
            vault: &self.vault,
            collateral: collateral.to_string(),
            pub_x: &pub_x,
            pub_y: &pub_y,
            gas: self.gas_limit,
        };
        self.submit("/vaults/register", &body).await
    }

    async fn issue_status(&self, id: RequestId) -> Result<RequestStatus, ContractError> {
        let resp: StatusResponse = self.get_json(&format!("/issues/{}/status", id)).await?;
        Ok(resp.status)
    }

    async fn redeem_status(&self, id: RequestId) -> Result<RequestStatus, ContractError> {
        let resp: StatusResponse = self.get_json(&format!("/redeems/{}/status", id)).await?;
        Ok(resp.status)
    }

    async fn requests(
        &self,
        kind: RequestKind,
        since: u64,
    ) -> Result<Vec<BridgeRequest>, ContractError> {
        let path = match kind {
            RequestKind::Issue => "issues",
            RequestKind::Redeem => "redeems",
        };
        self.get_json(&format!("/{}?vault={}&since={}", path, self.vault, since))
            .await
    }

    async fn notify_redeem_complete(
        &self,
        id: RequestId,
        btc_txid: String,
    ) -> Result<TxReceipt, ContractError> {
        let body = CompleteRedeemBody {
            vault: &self.vault,
            btc_tx: &btc_txid,
            gas: self.gas_limit,
        };
        self.submit(&format!("/redeems/{}/complete", id), &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_urls() {
        let gateway = HttpContractGateway::new("http://localhost:8545/", "0xvault", 6_721_900);
        assert_eq!(gateway.base_url, "http://localhost:8545");
        assert_eq!(gateway.vault_address(), "0xvault");
    }

    #[test]
    fn test_register_body_shape() {
        let body = RegisterBody {
            vault: "0xvault",
            collateral: 10u128.pow(20).to_string(),
            pub_x: "0x01",
            pub_y: "0x02",
            gas: 100,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["collateral"], "100000000000000000000");
        assert_eq!(json["pubX"], "0x01");
    }

    #[test]
    fn test_on_chain_vault_parsing() {
        let vault: OnChainVault = serde_json::from_value(serde_json::json!({
            "registered": true,
            "status": "1",
            "collateral": "5000",
            "pubX": "0xaa",
            "pubY": null
        }))
        .unwrap();
        assert!(vault.registered);
        assert_eq!(vault.pub_x.as_deref(), Some("0xaa"));
    }
}
