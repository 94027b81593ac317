//! Vault Client - Custodial BTC Vault Service
//!
//! Run modes:
//!   vault-client run                         - Start the vault client (until Ctrl+C)
//!   vault-client info                        - Print vault status and balances
//!   vault-client free-outputs [amount]       - List spendable outputs
//!   vault-client register <collateral>       - Register the vault on the contract
//!   vault-client operations [status]         - List stored operations
//!   vault-client derive-address <funding_id> - Print the deposit address for a request id
//!
//! Configuration comes from `VAULT_*` environment variables (a `.env` file is
//! loaded when present).

use std::env;
use std::sync::Arc;

use vault_client::bitcoin::{BitcoinNetwork, EsploraClient};
use vault_client::common::{init_from_config, Result, VaultConfig, VaultError};
use vault_client::contract::{BridgeContract, HttpContractGateway};
use vault_client::events::EventBus;
use vault_client::storage::{Query, Sort, SqliteStore};
use vault_client::sync::{IssueRequestStrategy, RedeemRequestStrategy, RequestSync, SyncSettings};
use vault_client::types::{parse_sats, sats_to_display, OperationStatus, RequestId};
use vault_client::vault::{ClientSettings, VaultClient};
use vault_client::wallet::{KeyDeriver, WalletBtc};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "run" => run_client().await,
        "info" => show_info().await,
        "free-outputs" => list_free_outputs(&args[2..]).await,
        "register" => register_vault(&args[2..]).await,
        "operations" => list_operations(&args[2..]).await,
        "derive-address" => derive_address(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error [{}]: {}", e.error_code(), e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Vault Client - Custodial BTC Vault");
    println!();
    println!("Usage:");
    println!("  vault-client run                          Start the vault client");
    println!("  vault-client info                         Print vault status and balances");
    println!("  vault-client free-outputs [amount]        List spendable outputs (sats)");
    println!("  vault-client register <collateral>        Register the vault on the contract");
    println!("  vault-client operations [status]          List stored operations");
    println!("  vault-client derive-address <funding_id>  Deposit address for a request id");
    println!();
    println!("Environment Variables:");
    println!("  VAULT_BTC_MASTER_KEY   Hex-encoded 32-byte master secret");
    println!("  VAULT_ADDRESS          Vault address on the contract chain");
    println!("  VAULT_CONTRACT_URL     Bridge contract gateway endpoint");
    println!("  VAULT_NETWORK          mainnet | testnet | devnet (default: testnet)");
    println!("  VAULT_ESPLORA_URL      Esplora API endpoint");
    println!("  VAULT_DASHBOARD_URL    Dashboard endpoint for liveness pings");
    println!("  VAULT_DB_PATH          SQLite database (default: data/vault.db)");
}

fn load_config() -> Result<VaultConfig> {
    let config = VaultConfig::from_env()?;
    init_from_config(&config)?;
    Ok(config)
}

/// Wire the client from configuration
fn build_client(config: &VaultConfig) -> Result<Arc<VaultClient>> {
    let store = Arc::new(SqliteStore::new(&config.db_path)?);

    let network: Arc<dyn BitcoinNetwork> = Arc::new(EsploraClient::new(&config.esplora_url));
    let contract: Arc<dyn BridgeContract> = Arc::new(HttpContractGateway::new(
        &config.contract_url,
        &config.vault_address,
        config.gas_limit,
    ));

    let btc_network = config.network.bitcoin_network();
    let deriver = Arc::new(KeyDeriver::new(config.master_secret.clone(), btc_network));
    let wallet = Arc::new(WalletBtc::new(
        &config.vault_address,
        config.wallet_settings(),
        deriver,
        network.clone(),
        store.clone(),
    ));

    let events = EventBus::default();
    let sync_settings = SyncSettings {
        interval: config.sync_interval,
        ..SyncSettings::default()
    };
    let syncs = vec![
        Arc::new(RequestSync::new(
            Arc::new(IssueRequestStrategy::new(
                contract.clone(),
                network.clone(),
                btc_network,
            )),
            contract.clone(),
            store.clone(),
            events.clone(),
            sync_settings.clone(),
        )),
        Arc::new(RequestSync::new(
            Arc::new(RedeemRequestStrategy::new(
                contract.clone(),
                network,
                btc_network,
            )),
            contract.clone(),
            store.clone(),
            events.clone(),
            sync_settings,
        )),
    ];

    Ok(Arc::new(VaultClient::new(
        ClientSettings::from(config),
        wallet,
        contract,
        store,
        events,
        syncs,
    )))
}

async fn run_client() -> Result<()> {
    let config = load_config()?;
    config.print_summary();

    let client = build_client(&config)?;
    client.start().await?;

    println!();
    println!("Vault {} running", client.vault_address());
    println!("Press Ctrl+C to stop");
    println!();

    tokio::signal::ctrl_c().await?;
    client.stop().await;
    Ok(())
}

async fn show_info() -> Result<()> {
    let config = load_config()?;
    let client = build_client(&config)?;

    let info = client.info().await?;
    let json = serde_json::to_string_pretty(&info).map_err(|e| VaultError::internal(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

async fn list_free_outputs(args: &[String]) -> Result<()> {
    let amount = match args.first() {
        Some(value) => Some(parse_sats(value).map_err(|e| VaultError::validation(e.to_string()))?),
        None => None,
    };

    let config = load_config()?;
    let client = build_client(&config)?;
    let outputs = client.list_free_outputs(amount).await?;

    let total: u64 = outputs.iter().map(|o| o.value_sats).sum();
    for output in &outputs {
        println!(
            "{}:{}  {}  {}  funding {}",
            output.tx_hash,
            output.output_index,
            sats_to_display(output.value_sats),
            output.owning_address,
            output.funding_id
        );
    }
    println!();
    println!("{} outputs, {}", outputs.len(), sats_to_display(total));
    Ok(())
}

async fn register_vault(args: &[String]) -> Result<()> {
    let collateral: u128 = args
        .first()
        .ok_or_else(|| VaultError::validation("usage: register <collateral>"))?
        .parse()
        .map_err(|_| VaultError::validation("collateral must be an unsigned integer"))?;

    let config = load_config()?;
    let client = build_client(&config)?;
    let receipt = client.register(collateral).await?;

    println!("Registered vault {}", client.vault_address());
    println!("Transaction: {}", receipt.transaction_hash);
    Ok(())
}

async fn list_operations(args: &[String]) -> Result<()> {
    let mut query = Query::all().with_sort(Sort::descending("lastUpdate"));
    if let Some(status) = args.first() {
        let status: OperationStatus = status.parse().map_err(VaultError::validation)?;
        query = query.with_filter("status", status.as_str());
    }

    let config = load_config()?;
    let client = build_client(&config)?;
    let page = client.get_data(&query).await?;

    for record in &page.content {
        println!(
            "{}  {}  {:<12}  {}  {}",
            record.id,
            record.op_type,
            record.status,
            sats_to_display(record.amount),
            record.btc_txid.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("{} operations", page.total_elements);
    Ok(())
}

fn derive_address(args: &[String]) -> Result<()> {
    let funding_id: RequestId = args
        .first()
        .ok_or_else(|| VaultError::validation("usage: derive-address <funding_id>"))?
        .parse()
        .map_err(|e: vault_client::types::RequestIdError| VaultError::validation(e.to_string()))?;

    let config = VaultConfig::from_env()?;
    let deriver = KeyDeriver::new(config.master_secret, config.network.bitcoin_network());
    println!("{}", deriver.deposit_address(&funding_id));
    Ok(())
}
