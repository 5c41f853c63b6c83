//! In-memory balance cache emitting only true changes.

use crate::ledger::{Address, LedgerClient};
use crate::wallet::sync::stores::{AddressStore, BalancePatch};
use crate::wallet::types::WalletSyncError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedBalances {
	/// Token balance per configured token contract.
	tokens: Vec<(Address, u128)>,
	native: u128,
}

/// Last-observed on-chain balances per address, one token balance per
/// configured token contract.
///
/// `refresh` emits a patch only for fields that actually changed, so
/// unchanged balances cause no downstream writes. Entries are created lazily
/// on first refresh and dropped on `forget`, which makes a later
/// re-subscription look like a brand new address. Overlapping refreshes for
/// the same address are not serialized here; callers debounce per address,
/// otherwise stale-overwrites-last-wins applies.
pub struct BalanceCache {
	client: Arc<dyn LedgerClient>,
	store: Arc<dyn AddressStore>,
	token_contracts: Vec<Address>,
	cached: Mutex<HashMap<Address, ObservedBalances>>,
}

impl BalanceCache {
	pub fn new(
		client: Arc<dyn LedgerClient>,
		store: Arc<dyn AddressStore>,
		token_contracts: Vec<Address>,
	) -> Self {
		Self {
			client,
			store,
			token_contracts,
			cached: Mutex::new(HashMap::new()),
		}
	}

	/// Re-read on-chain balances and patch the store for true changes.
	pub async fn refresh(&self, addresses: &[Address]) -> Result<(), WalletSyncError> {
		for address in addresses {
			let mut tokens = Vec::with_capacity(self.token_contracts.len());
			for contract in &self.token_contracts {
				let balance = self.client.token_balance(contract, address).await?;
				tokens.push((contract.clone(), balance));
			}
			let native = self.client.native_balance(address).await?;
			let observed = ObservedBalances {
				tokens: tokens.clone(),
				native,
			};

			let patch = {
				let mut cached = self.cached.lock().unwrap();
				let patch = match cached.get(address) {
					Some(previous) => BalancePatch {
						balances: tokens
							.into_iter()
							.filter(|entry| !previous.tokens.contains(entry))
							.collect(),
						native_balance: (previous.native != native).then_some(native),
					},
					// First observation reports every field.
					None => BalancePatch {
						balances: tokens,
						native_balance: Some(native),
					},
				};
				cached.insert(address.clone(), observed);
				patch
			};

			if patch.is_empty() {
				debug!("Balances unchanged for {}", address);
				continue;
			}
			info!(
				"Balance change for {}: tokens={:?} native={:?}",
				address, patch.balances, patch.native_balance
			);
			self.store.patch_balance(address, patch).await?;
		}
		Ok(())
	}

	/// Drop cached entries so the addresses read as new on re-subscription.
	pub fn forget(&self, addresses: &[Address]) {
		let mut cached = self.cached.lock().unwrap();
		for address in addresses {
			cached.remove(address);
		}
		debug!("Forgot cached balances for {} addresses", addresses.len());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::{
		Block, LedgerError, LogStream, RawLog, Receipt, TransferSide, TxHash,
	};
	use crate::wallet::sync::stores::testing::MemoryAddressStore;
	use std::sync::atomic::{AtomicU64, Ordering};

	const PRIMARY: &str = "0x000000000000000000000000000000000000070c";
	const SECONDARY: &str = "0x000000000000000000000000000000000000070d";

	/// Client stub with a settable balance for the primary token contract,
	/// fixed balances elsewhere.
	struct StubClient {
		token_balance: AtomicU64,
	}

	#[async_trait::async_trait]
	impl LedgerClient for StubClient {
		async fn current_height(&self) -> Result<u64, LedgerError> {
			Ok(0)
		}
		async fn query_transfer_logs(
			&self,
			_token: &Address,
			_side: &TransferSide,
			_from_height: u64,
			_to_height: u64,
		) -> Result<Vec<RawLog>, LedgerError> {
			Ok(Vec::new())
		}
		async fn get_receipt(&self, _hash: &TxHash) -> Result<Receipt, LedgerError> {
			Err(LedgerError::NoData)
		}
		async fn get_block(&self, _block_hash: &str) -> Result<Block, LedgerError> {
			Err(LedgerError::NoData)
		}
		async fn native_balance(&self, _address: &Address) -> Result<u128, LedgerError> {
			Ok(5)
		}
		async fn token_balance(
			&self,
			token: &Address,
			_address: &Address,
		) -> Result<u128, LedgerError> {
			if token == PRIMARY {
				Ok(u128::from(self.token_balance.load(Ordering::SeqCst)))
			} else {
				Ok(7)
			}
		}
		async fn nonce_of(&self, _address: &Address) -> Result<u64, LedgerError> {
			Ok(0)
		}
		async fn allowance(
			&self,
			_token: &Address,
			_owner: &Address,
			_spender: &Address,
		) -> Result<u128, LedgerError> {
			Ok(0)
		}
		async fn subscribe_transfers(
			&self,
			_tokens: &[Address],
			_recipients: &[Address],
		) -> Result<LogStream, LedgerError> {
			Ok(Box::pin(futures::stream::empty()))
		}
	}

	fn cache_with(
		balance: u64,
		contracts: Vec<Address>,
	) -> (BalanceCache, Arc<MemoryAddressStore>, Arc<StubClient>) {
		let client = Arc::new(StubClient {
			token_balance: AtomicU64::new(balance),
		});
		let store = Arc::new(MemoryAddressStore::default());
		let cache = BalanceCache::new(client.clone(), store.clone(), contracts);
		(cache, store, client)
	}

	#[tokio::test]
	async fn emits_patch_only_on_change() {
		let (cache, store, client) = cache_with(100, vec![PRIMARY.to_string()]);
		let address = vec!["0xaa".to_string()];

		cache.refresh(&address).await.unwrap();
		cache.refresh(&address).await.unwrap();
		assert_eq!(store.patches.lock().unwrap().len(), 1);

		client.token_balance.store(150, Ordering::SeqCst);
		cache.refresh(&address).await.unwrap();

		let patches = store.patches.lock().unwrap();
		assert_eq!(patches.len(), 2);
		// Only the changed field is set on the second patch.
		assert_eq!(patches[1].1.balances, vec![(PRIMARY.to_string(), 150)]);
		assert_eq!(patches[1].1.native_balance, None);
	}

	#[tokio::test]
	async fn forget_makes_resubscription_first_time() {
		let (cache, store, _client) = cache_with(100, vec![PRIMARY.to_string()]);
		let address = vec!["0xaa".to_string()];

		cache.refresh(&address).await.unwrap();
		cache.forget(&address);
		cache.refresh(&address).await.unwrap();

		let patches = store.patches.lock().unwrap();
		assert_eq!(patches.len(), 2);
		// Re-reported as new: every field present again.
		assert_eq!(patches[1].1.balances, vec![(PRIMARY.to_string(), 100)]);
		assert_eq!(patches[1].1.native_balance, Some(5));
	}

	#[tokio::test]
	async fn tracks_each_configured_token() {
		let (cache, store, client) =
			cache_with(100, vec![PRIMARY.to_string(), SECONDARY.to_string()]);
		let address = vec!["0xaa".to_string()];

		cache.refresh(&address).await.unwrap();
		client.token_balance.store(150, Ordering::SeqCst);
		cache.refresh(&address).await.unwrap();

		let patches = store.patches.lock().unwrap();
		// First observation covers both contracts.
		assert_eq!(
			patches[0].1.balances,
			vec![(PRIMARY.to_string(), 100), (SECONDARY.to_string(), 7)]
		);
		// Only the contract whose balance moved appears afterwards.
		assert_eq!(patches[1].1.balances, vec![(PRIMARY.to_string(), 150)]);
	}
}
