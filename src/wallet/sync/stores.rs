//! Store contracts the sync core emits into, with file-based implementations.
//!
//! The reactive address and transaction stores live outside the core; these
//! traits are the surface the core needs: read known history for an address,
//! upsert classified transactions keyed by hash, and patch balances. The
//! file-backed implementations keep one JSON document per concern plus a
//! small metadata file, so partial sync progress survives a restart.

use crate::ledger::{Address, TxHash};
use crate::wallet::types::{Transaction, WalletSyncError};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::info;

/// Partial balance update; only set fields are written downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancePatch {
	/// Changed token balances in base units, keyed by token contract.
	pub balances: Vec<(Address, u128)>,
	/// Native-coin balance in base units.
	pub native_balance: Option<u128>,
}

impl BalancePatch {
	pub fn is_empty(&self) -> bool {
		self.balances.is_empty() && self.native_balance.is_none()
	}
}

/// Store of canonical wallet transactions, keyed by transaction hash.
#[async_trait::async_trait]
pub trait TransactionStore: Send + Sync {
	/// Hashes already recorded for the address.
	async fn known_hashes(&self, address: &Address) -> Result<HashSet<TxHash>, WalletSyncError>;

	/// Upsert transactions; an existing record with the same hash is
	/// replaced wholesale, so retried writes are idempotent.
	async fn add_transactions(
		&self,
		address: &Address,
		transactions: &[Transaction],
	) -> Result<(), WalletSyncError>;

	/// Highest confirmed block height among the stored transactions.
	async fn last_confirmed_height(
		&self,
		address: &Address,
	) -> Result<Option<u64>, WalletSyncError>;
}

/// Store of per-address balances.
#[async_trait::async_trait]
pub trait AddressStore: Send + Sync {
	async fn patch_balance(
		&self,
		address: &Address,
		patch: BalancePatch,
	) -> Result<(), WalletSyncError>;
}

/// File-based implementation of TransactionStore
pub struct FileTransactionStore {
	data_dir: PathBuf,
	/// Serializes the read-modify-write cycle; concurrent history runs for
	/// one address persist through the same files.
	file_lock: tokio::sync::Mutex<()>,
}

impl FileTransactionStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			data_dir,
			file_lock: tokio::sync::Mutex::new(()),
		}
	}

	fn transactions_filename(&self, address: &Address) -> PathBuf {
		self.data_dir
			.join(format!("transactions_{}.json", address.trim_start_matches("0x")))
	}

	fn metadata_filename(&self, address: &Address) -> PathBuf {
		self.data_dir.join(format!(
			"transactions_{}.meta.json",
			address.trim_start_matches("0x")
		))
	}

	async fn read_map(
		&self,
		address: &Address,
	) -> Result<HashMap<TxHash, Transaction>, WalletSyncError> {
		let filename = self.transactions_filename(address);
		if !filename.exists() {
			return Ok(HashMap::new());
		}
		let content = tokio::fs::read_to_string(&filename).await?;
		serde_json::from_str(&content)
			.map_err(|e| WalletSyncError::Store(format!("Failed to parse {:?}: {}", filename, e)))
	}
}

#[async_trait::async_trait]
impl TransactionStore for FileTransactionStore {
	async fn known_hashes(&self, address: &Address) -> Result<HashSet<TxHash>, WalletSyncError> {
		let _guard = self.file_lock.lock().await;
		Ok(self.read_map(address).await?.into_keys().collect())
	}

	async fn add_transactions(
		&self,
		address: &Address,
		transactions: &[Transaction],
	) -> Result<(), WalletSyncError> {
		if transactions.is_empty() {
			return Ok(());
		}

		// Held across the read and both writes; an interleaved writer would
		// otherwise overwrite this upsert with its own stale snapshot.
		let _guard = self.file_lock.lock().await;
		let mut by_hash = self.read_map(address).await?;
		for transaction in transactions {
			by_hash.insert(transaction.transaction_hash.clone(), transaction.clone());
		}

		let metadata = serde_json::json!({
			"record_count": by_hash.len(),
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});
		tokio::fs::write(
			self.metadata_filename(address),
			serde_json::to_string_pretty(&metadata)
				.map_err(|e| WalletSyncError::Store(e.to_string()))?,
		)
		.await?;

		let filename = self.transactions_filename(address);
		let content = serde_json::to_string_pretty(&by_hash)
			.map_err(|e| WalletSyncError::Store(format!("Failed to serialize: {}", e)))?;
		tokio::fs::write(&filename, content).await?;

		info!(
			"Persisted {} transactions for {} ({} total)",
			transactions.len(),
			address,
			by_hash.len()
		);
		Ok(())
	}

	async fn last_confirmed_height(
		&self,
		address: &Address,
	) -> Result<Option<u64>, WalletSyncError> {
		let _guard = self.file_lock.lock().await;
		Ok(self
			.read_map(address)
			.await?
			.values()
			.filter_map(|transaction| transaction.block_height)
			.max())
	}
}

/// File-based implementation of AddressStore
pub struct FileAddressStore {
	data_dir: PathBuf,
	/// All addresses share one balances file, so patches for different
	/// addresses contend on the same read-modify-write cycle.
	file_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredBalances {
	balances: HashMap<Address, u128>,
	native_balance: Option<u128>,
}

impl FileAddressStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			data_dir,
			file_lock: tokio::sync::Mutex::new(()),
		}
	}

	fn balances_filename(&self) -> PathBuf {
		self.data_dir.join("balances.json")
	}
}

#[async_trait::async_trait]
impl AddressStore for FileAddressStore {
	async fn patch_balance(
		&self,
		address: &Address,
		patch: BalancePatch,
	) -> Result<(), WalletSyncError> {
		let _guard = self.file_lock.lock().await;
		let filename = self.balances_filename();
		let mut balances: HashMap<Address, StoredBalances> = if filename.exists() {
			let content = tokio::fs::read_to_string(&filename).await?;
			serde_json::from_str(&content).map_err(|e| {
				WalletSyncError::Store(format!("Failed to parse {:?}: {}", filename, e))
			})?
		} else {
			HashMap::new()
		};

		let entry = balances.entry(address.clone()).or_default();
		for (contract, balance) in patch.balances {
			entry.balances.insert(contract, balance);
		}
		if let Some(native_balance) = patch.native_balance {
			entry.native_balance = Some(native_balance);
		}

		let content = serde_json::to_string_pretty(&balances)
			.map_err(|e| WalletSyncError::Store(e.to_string()))?;
		tokio::fs::write(&filename, content).await?;

		info!("Patched balances for {}", address);
		Ok(())
	}
}

#[cfg(test)]
pub mod testing {
	//! In-memory store doubles shared by the sync module tests.

	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	pub struct MemoryTransactionStore {
		pub records: Mutex<HashMap<Address, HashMap<TxHash, Transaction>>>,
	}

	impl MemoryTransactionStore {
		pub fn transactions_for(&self, address: &Address) -> Vec<Transaction> {
			self.records
				.lock()
				.unwrap()
				.get(address)
				.map(|by_hash| by_hash.values().cloned().collect())
				.unwrap_or_default()
		}
	}

	#[async_trait::async_trait]
	impl TransactionStore for MemoryTransactionStore {
		async fn known_hashes(
			&self,
			address: &Address,
		) -> Result<HashSet<TxHash>, WalletSyncError> {
			Ok(self
				.records
				.lock()
				.unwrap()
				.get(address)
				.map(|by_hash| by_hash.keys().cloned().collect())
				.unwrap_or_default())
		}

		async fn add_transactions(
			&self,
			address: &Address,
			transactions: &[Transaction],
		) -> Result<(), WalletSyncError> {
			let mut records = self.records.lock().unwrap();
			let by_hash = records.entry(address.clone()).or_default();
			for transaction in transactions {
				by_hash.insert(transaction.transaction_hash.clone(), transaction.clone());
			}
			Ok(())
		}

		async fn last_confirmed_height(
			&self,
			address: &Address,
		) -> Result<Option<u64>, WalletSyncError> {
			Ok(self
				.records
				.lock()
				.unwrap()
				.get(address)
				.and_then(|by_hash| {
					by_hash
						.values()
						.filter_map(|transaction| transaction.block_height)
						.max()
				}))
		}
	}

	#[derive(Default)]
	pub struct MemoryAddressStore {
		pub patches: Mutex<Vec<(Address, BalancePatch)>>,
	}

	#[async_trait::async_trait]
	impl AddressStore for MemoryAddressStore {
		async fn patch_balance(
			&self,
			address: &Address,
			patch: BalancePatch,
		) -> Result<(), WalletSyncError> {
			self.patches.lock().unwrap().push((address.clone(), patch));
			Ok(())
		}
	}
}
