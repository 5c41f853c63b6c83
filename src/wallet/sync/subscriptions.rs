//! Live transfer subscription management.
//!
//! The manager owns the wallet's watch set and keeps a single WebSocket
//! log subscription aligned with it. Watch set changes are applied as a
//! diff: departed addresses are evicted from the caches first, then the
//! subscription filter is swapped, then newly watched addresses get their
//! first balance snapshot.

use crate::ledger::{Address, LedgerClient, RawLog};
use crate::wallet::sync::balance_cache::BalanceCache;
use crate::wallet::sync::history::FetchMarkers;
use crate::wallet::types::WalletSyncError;

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Diff applied by one reconcile pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
	pub added: Vec<Address>,
	pub removed: Vec<Address>,
}

pub struct SubscriptionManager {
	client: Arc<dyn LedgerClient>,
	token_contracts: Vec<Address>,
	balance_cache: Arc<BalanceCache>,
	markers: Arc<FetchMarkers>,
	sender: mpsc::UnboundedSender<RawLog>,
	watch_set: Mutex<HashSet<Address>>,
	active: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
	/// Incoming transfer logs matched by the live filter are forwarded to
	/// `sender`; the session drains the paired receiver.
	pub fn new(
		client: Arc<dyn LedgerClient>,
		token_contracts: Vec<Address>,
		balance_cache: Arc<BalanceCache>,
		markers: Arc<FetchMarkers>,
		sender: mpsc::UnboundedSender<RawLog>,
	) -> Self {
		Self {
			client,
			token_contracts,
			balance_cache,
			markers,
			sender,
			watch_set: Mutex::new(HashSet::new()),
			active: tokio::sync::Mutex::new(None),
		}
	}

	/// Align the live subscription with a new watch set.
	///
	/// Evictions run before anything is done for additions, so stale
	/// balances and history markers of a departed address are gone before
	/// any new fetch starts. An unchanged set is a no-op and leaves the
	/// existing subscription untouched.
	pub async fn reconcile(
		&self,
		current: &[Address],
	) -> Result<ReconcileOutcome, WalletSyncError> {
		let desired: HashSet<Address> = current.iter().cloned().collect();
		let (added, removed) = {
			let watched = self.watch_set.lock().unwrap();
			let mut added: Vec<Address> = desired.difference(&watched).cloned().collect();
			let mut removed: Vec<Address> = watched.difference(&desired).cloned().collect();
			added.sort();
			removed.sort();
			(added, removed)
		};

		if added.is_empty() && removed.is_empty() {
			debug!("Watch set unchanged, keeping current subscription");
			return Ok(ReconcileOutcome::default());
		}

		info!(
			"Reconciling watch set: {} added, {} removed",
			added.len(),
			removed.len()
		);

		for address in &removed {
			self.balance_cache.forget(std::slice::from_ref(address));
			self.markers.forget_address(address);
		}

		self.rearm(&desired).await?;
		*self.watch_set.lock().unwrap() = desired;

		if !added.is_empty() {
			self.balance_cache.refresh(&added).await?;
		}

		Ok(ReconcileOutcome { added, removed })
	}

	/// Swap the live filter for the full new watch set. The replacement is
	/// installed before the old task is aborted so no window is left with
	/// only the stale filter believed active.
	async fn rearm(&self, desired: &HashSet<Address>) -> Result<(), WalletSyncError> {
		let mut active = self.active.lock().await;

		if desired.is_empty() {
			if let Some(old) = active.take() {
				info!("Watch set empty, tearing down live subscription");
				old.abort();
			}
			return Ok(());
		}

		let mut recipients: Vec<Address> = desired.iter().cloned().collect();
		recipients.sort();
		let mut stream = self
			.client
			.subscribe_transfers(&self.token_contracts, &recipients)
			.await?;

		let sender = self.sender.clone();
		let replacement = tokio::spawn(async move {
			while let Some(entry) = stream.next().await {
				match entry {
					Ok(log) => {
						if sender.send(log).is_err() {
							break;
						}
					}
					Err(e) => warn!("Dropping undecodable subscription entry: {}", e),
				}
			}
			debug!("Live subscription stream ended");
		});

		if let Some(old) = active.replace(replacement) {
			old.abort();
		}
		Ok(())
	}

	#[cfg(test)]
	fn watched(&self) -> HashSet<Address> {
		self.watch_set.lock().unwrap().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::{
		Block, LedgerError, LogStream, Receipt, TransferSide, TxHash,
	};
	use crate::wallet::sync::stores::testing::MemoryAddressStore;
	use crate::wallet::types::TokenVariant;
	use std::sync::atomic::{AtomicUsize, Ordering};

	const ALICE: &str = "0x00000000000000000000000000000000000000a1";
	const BOB: &str = "0x00000000000000000000000000000000000000b2";
	const CAROL: &str = "0x00000000000000000000000000000000000000c3";

	#[derive(Default)]
	struct StubLedger {
		subscribe_calls: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl LedgerClient for StubLedger {
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
			Ok(3)
		}

		async fn token_balance(
			&self,
			_token: &Address,
			_address: &Address,
		) -> Result<u128, LedgerError> {
			Ok(7)
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
			self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
			Ok(Box::pin(futures::stream::empty()))
		}
	}

	fn manager(
		client: Arc<StubLedger>,
		markers: Arc<FetchMarkers>,
	) -> (SubscriptionManager, mpsc::UnboundedReceiver<RawLog>) {
		let store = Arc::new(MemoryAddressStore::default());
		let cache = Arc::new(BalanceCache::new(
			client.clone(),
			store,
			vec!["0x000000000000000000000000000000000000070c".to_string()],
		));
		let (sender, receiver) = mpsc::unbounded_channel();
		(
			SubscriptionManager::new(
				client,
				vec!["0x000000000000000000000000000000000000070c".to_string()],
				cache,
				markers,
				sender,
			),
			receiver,
		)
	}

	#[tokio::test]
	async fn reconcile_diffs_added_and_removed() {
		let client = Arc::new(StubLedger::default());
		let markers = Arc::new(FetchMarkers::default());
		let (manager, _receiver) = manager(client.clone(), markers.clone());

		let outcome = manager
			.reconcile(&[ALICE.to_string(), BOB.to_string()])
			.await
			.unwrap();
		assert_eq!(outcome.added, vec![ALICE.to_string(), BOB.to_string()]);
		assert!(outcome.removed.is_empty());
		assert_eq!(client.subscribe_calls.load(Ordering::SeqCst), 1);

		// A completed history run leaves a marker behind for Alice.
		assert!(markers.try_begin(&ALICE.to_string(), TokenVariant::Bridged));

		let outcome = manager
			.reconcile(&[BOB.to_string(), CAROL.to_string()])
			.await
			.unwrap();
		assert_eq!(outcome.added, vec![CAROL.to_string()]);
		assert_eq!(outcome.removed, vec![ALICE.to_string()]);
		assert_eq!(
			manager.watched(),
			HashSet::from([BOB.to_string(), CAROL.to_string()])
		);

		// Eviction dropped Alice's marker, so a re-subscription would run
		// her history sync from scratch.
		assert!(markers.try_begin(&ALICE.to_string(), TokenVariant::Bridged));
	}

	#[tokio::test]
	async fn unchanged_watch_set_is_a_no_op() {
		let client = Arc::new(StubLedger::default());
		let (manager, _receiver) = manager(client.clone(), Arc::new(FetchMarkers::default()));

		manager.reconcile(&[ALICE.to_string()]).await.unwrap();
		assert_eq!(client.subscribe_calls.load(Ordering::SeqCst), 1);

		let outcome = manager.reconcile(&[ALICE.to_string()]).await.unwrap();
		assert_eq!(outcome, ReconcileOutcome::default());
		// The live filter was not re-armed.
		assert_eq!(client.subscribe_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn emptied_watch_set_tears_down_subscription() {
		let client = Arc::new(StubLedger::default());
		let (manager, _receiver) = manager(client.clone(), Arc::new(FetchMarkers::default()));

		manager.reconcile(&[ALICE.to_string()]).await.unwrap();
		let outcome = manager.reconcile(&[]).await.unwrap();
		assert_eq!(outcome.removed, vec![ALICE.to_string()]);
		assert!(manager.watched().is_empty());
		// No new subscription was opened for the empty set.
		assert_eq!(client.subscribe_calls.load(Ordering::SeqCst), 1);
	}
}
