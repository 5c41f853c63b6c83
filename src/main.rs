mod ledger;
mod relay;
mod utils;
mod wallet;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::ledger::{JsonRpcLedgerClient, LedgerClient};
use crate::relay::{RelayInfo, StaticRelayList};
use crate::utils::format_token_amount;
use crate::wallet::sync::history::SyncConfig;
use crate::wallet::sync::stores::{FileAddressStore, FileTransactionStore};
use crate::wallet::{SyncSession, TokenConfig, TokenVariant};

fn env_or(name: &str, default: &str) -> String {
	std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn token_config(variant: TokenVariant, contract: String) -> TokenConfig {
	TokenConfig {
		variant,
		contract,
		decimals: 18,
		fee_collectors: env_or("FEE_COLLECTORS", "")
			.split(',')
			.filter(|collector| !collector.is_empty())
			.map(str::to_string)
			.collect(),
		escrow_contract: env_or("ESCROW_CONTRACT", ""),
		swap_pool: env_or("SWAP_POOL", ""),
	}
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	// Initialize tracing subscriber with debug logging for the sync engine
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive("token_wallet_sync=debug".parse().unwrap())
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");

	let rpc_url = env_or("RPC_URL", "http://localhost:8545");
	let ws_url = env_or("WS_URL", "ws://localhost:8546");
	let data_dir = PathBuf::from(env_or("DATA_DIR", "./wallet-data"));
	if let Err(e) = std::fs::create_dir_all(&data_dir) {
		error!("Could not create data directory {:?}: {}", data_dir, e);
		return;
	}

	let watch_addresses: Vec<String> = env_or("WATCH_ADDRESSES", "")
		.split(',')
		.filter(|address| !address.is_empty())
		.map(|address| address.trim().to_ascii_lowercase())
		.collect();
	if watch_addresses.is_empty() {
		error!("WATCH_ADDRESSES is empty, nothing to sync");
		return;
	}

	let mut tokens = Vec::new();
	let native_contract = env_or("NATIVE_TOKEN_CONTRACT", "");
	if !native_contract.is_empty() {
		tokens.push(token_config(TokenVariant::Native, native_contract));
	}
	let bridged_contract = env_or("BRIDGED_TOKEN_CONTRACT", "");
	if !bridged_contract.is_empty() {
		tokens.push(token_config(TokenVariant::Bridged, bridged_contract));
	}
	if tokens.is_empty() {
		error!("No token contracts configured, set NATIVE_TOKEN_CONTRACT or BRIDGED_TOKEN_CONTRACT");
		return;
	}
	let decimals = tokens[0].decimals;

	let relays = Arc::new(StaticRelayList::new(
		env_or("RELAY_POOLS", "")
			.split(',')
			.filter(|pool| !pool.is_empty())
			.map(|pool| RelayInfo {
				pool_address: pool.trim().to_ascii_lowercase(),
				url: env_or("RELAY_URL", "http://localhost:7000"),
				fee_ppm: env_or("RELAY_FEE_PPM", "500").parse().unwrap_or(500),
			})
			.collect(),
	));

	let client = Arc::new(JsonRpcLedgerClient::new(rpc_url, ws_url));
	let tx_store = Arc::new(FileTransactionStore::new(data_dir.clone()));
	let addr_store = Arc::new(FileAddressStore::new(data_dir));

	let balance_probe = client.clone();
	let probe_token = tokens[0].contract.clone();
	let probe_address = watch_addresses[0].clone();

	let session = SyncSession::new(
		client,
		tx_store,
		addr_store,
		tokens,
		relays,
		SyncConfig::default(),
	);

	info!("Created sync session");

	if let Err(e) = session.on_watch_set_changed(&watch_addresses).await {
		error!("Failed to apply watch set: {:?}", e);
		return;
	}

	info!(
		"Watching {} addresses, waiting for history syncs",
		watch_addresses.len()
	);

	loop {
		tokio::time::sleep(Duration::from_secs(1)).await;
		let in_flight = session.history_sync_progress();
		if in_flight == 0 {
			break;
		}
		info!("{} history syncs in flight", in_flight);
	}

	info!("Initial history sync complete");

	match balance_probe.token_balance(&probe_token, &probe_address).await {
		Ok(balance) => info!(
			"Current balance of {}: {}",
			probe_address,
			format_token_amount(balance, decimals)
		),
		Err(e) => warn!("Balance probe failed: {}", e),
	}

	// Live subscription keeps running inside the session.
	loop {
		tokio::time::sleep(Duration::from_secs(60)).await;
	}
}
