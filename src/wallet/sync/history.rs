//! Backward chunked history scanner.
//!
//! One logical run per (address, token variant) pair reconstructs that
//! pair's transaction history by walking the chain backward in bounded
//! chunks. Each chunk issues the paired incoming/outgoing log queries,
//! prefetches receipts for escrow and swap correlation, classifies the
//! batch, and persists results immediately so partial progress survives a
//! later failure. The reconciliation arithmetic lives in `SyncCursor`; this
//! module is the thin driver around it.

use crate::ledger::{Address, LedgerClient, RawLog, Receipt, TransferSide, TxHash};
use crate::wallet::sync::classifier::EventClassifier;
use crate::wallet::sync::cursor::SyncCursor;
use crate::wallet::sync::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::wallet::sync::stores::TransactionStore;
use crate::wallet::types::{TokenConfig, TokenVariant, WalletSyncError};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Configuration for history scan runs
#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Blocks covered by one backward chunk
	pub step_blocks: u64,
	/// Blocks re-checked below the last confirmed height, in case of a
	/// chain reorganization
	pub overlap_margin: u64,
	/// Absolute lower bound of any scan (token deployment height)
	pub floor_height: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			step_blocks: 5_000,
			overlap_margin: 1_000,
			floor_height: 0,
		}
	}
}

/// "History fetched" markers, one per (address, token variant) pair.
///
/// A marker is set when a run starts and doubles as the at-most-one-run
/// guard: a second trigger while it is set is suppressed rather than
/// preempting the first. It is cleared on failure so a later trigger
/// retries, and on unsubscription so a re-subscribed address fetches its
/// full history again. It survives success.
#[derive(Default)]
pub struct FetchMarkers {
	inner: Mutex<HashSet<(Address, TokenVariant)>>,
}

impl FetchMarkers {
	/// Set the marker; `false` when a run is already outstanding or done.
	pub fn try_begin(&self, address: &Address, variant: TokenVariant) -> bool {
		self.inner
			.lock()
			.unwrap()
			.insert((address.clone(), variant))
	}

	/// Clear one pair's marker so the next trigger retries.
	pub fn clear(&self, address: &Address, variant: TokenVariant) {
		self.inner
			.lock()
			.unwrap()
			.remove(&(address.clone(), variant));
	}

	/// Drop every marker of an unsubscribed address.
	pub fn forget_address(&self, address: &Address) {
		self.inner
			.lock()
			.unwrap()
			.retain(|(marked, _)| marked != address);
	}
}

/// Driver for backward history scan runs.
pub struct HistorySync {
	client: Arc<dyn LedgerClient>,
	tx_store: Arc<dyn TransactionStore>,
	markers: Arc<FetchMarkers>,
	in_flight: Arc<AtomicUsize>,
	config: SyncConfig,
}

impl HistorySync {
	pub fn new(
		client: Arc<dyn LedgerClient>,
		tx_store: Arc<dyn TransactionStore>,
		markers: Arc<FetchMarkers>,
		in_flight: Arc<AtomicUsize>,
		config: SyncConfig,
	) -> Self {
		Self {
			client,
			tx_store,
			markers,
			in_flight,
			config,
		}
	}

	/// Run one guarded history sync for the pair.
	///
	/// Failures are terminal for the run only: they are logged, the fetched
	/// marker is cleared so a later trigger retries from scratch (the
	/// overlap margin makes that safe), and nothing propagates to the
	/// caller.
	pub async fn sync(&self, address: &Address, token: &TokenConfig) {
		if !self.markers.try_begin(address, token.variant) {
			debug!(
				"History sync already active or complete for {} ({:?})",
				address, token.variant
			);
			return;
		}

		self.in_flight.fetch_add(1, Ordering::SeqCst);
		info!("Starting history sync for {} ({:?})", address, token.variant);

		match self.run(address, token).await {
			Ok(stats) => info!("History sync finished: {}", stats.summary()),
			Err(e) => {
				error!(
					"History sync failed for {} ({:?}): {}",
					address, token.variant, e
				);
				self.markers.clear(address, token.variant);
			}
		}

		self.in_flight.fetch_sub(1, Ordering::SeqCst);
	}

	/// The Init → Scanning → Done state machine of one run.
	async fn run(
		&self,
		address: &Address,
		token: &TokenConfig,
	) -> Result<SyncStats, WalletSyncError> {
		let classifier = EventClassifier::new(token.clone());

		let current_height = self.client.current_height().await?;
		let last_confirmed = self.tx_store.last_confirmed_height(address).await?;
		let earliest_height_to_check = last_confirmed
			.map(|height| height.saturating_sub(self.config.overlap_margin))
			.unwrap_or(self.config.floor_height)
			.max(self.config.floor_height);

		let remaining_balance = self.client.token_balance(&token.contract, address).await?;
		let remaining_nonce = self.client.nonce_of(address).await?;
		let mut remaining_allowances = Vec::new();
		for spender in token.allowance_spenders() {
			let left = self
				.client
				.allowance(&token.contract, address, &spender)
				.await?;
			remaining_allowances.push((spender, left));
		}

		let mut known = self.tx_store.known_hashes(address).await?;
		let mut cursor = SyncCursor::new(
			earliest_height_to_check,
			current_height,
			remaining_balance,
			remaining_nonce,
			remaining_allowances,
		);
		let mut tracker = SyncProgressTracker::new(current_height);

		while !cursor.finished() {
			let (chunk_start, chunk_end) = cursor.next_chunk(self.config.step_blocks);

			// The query model matches one indexed parameter per call, hence
			// the paired queries for the two transfer sides.
			let incoming = self
				.client
				.query_transfer_logs(
					&token.contract,
					&TransferSide::Incoming(address.clone()),
					chunk_start,
					chunk_end,
				)
				.await?;
			let outgoing = self
				.client
				.query_transfer_logs(
					&token.contract,
					&TransferSide::Outgoing(address.clone()),
					chunk_start,
					chunk_end,
				)
				.await?;

			// Self-transfers come back from both queries once each.
			let mut seen = HashSet::new();
			let mut logs: Vec<RawLog> = Vec::with_capacity(incoming.len() + outgoing.len());
			for log in incoming.into_iter().chain(outgoing.iter().cloned()) {
				if log.args.value == 0 {
					continue;
				}
				if seen.insert((log.transaction_hash.clone(), log.log_index)) {
					logs.push(log);
				}
			}

			let receipts = self.prefetch_receipts(&logs, token).await;
			let timestamps = self.prefetch_timestamps(&logs).await;

			let mut transactions = classifier.classify(&logs, &receipts, &known)?;
			for transaction in &mut transactions {
				transaction.timestamp = transaction
					.block_height
					.and_then(|height| timestamps.get(&height).copied());
			}

			// Persist before advancing so a failed later chunk loses nothing.
			self.tx_store.add_transactions(address, &transactions).await?;
			for transaction in &transactions {
				known.insert(transaction.transaction_hash.clone());
			}

			tracker.record_chunk(chunk_start, logs.len());
			tracker.record_transactions(transactions.len());
			tracker.log_progress(false);

			let outgoing_spent: Vec<RawLog> = outgoing
				.into_iter()
				.filter(|log| log.args.value > 0)
				.collect();
			cursor = cursor.step(chunk_start, &outgoing_spent, &token.escrow_contract);
		}

		tracker.log_progress(true);
		Ok(tracker.get_stats())
	}

	/// Fetch receipts for transactions that touch the escrow contract or
	/// the swap pool. A failed fetch only costs that transaction its
	/// lifecycle enrichment.
	async fn prefetch_receipts(
		&self,
		logs: &[RawLog],
		token: &TokenConfig,
	) -> HashMap<TxHash, Receipt> {
		let mut receipts = HashMap::new();
		for log in logs {
			let touches_escrow = log.args.to.eq_ignore_ascii_case(&token.escrow_contract)
				|| log.args.from.eq_ignore_ascii_case(&token.escrow_contract);
			let touches_pool = log.args.to.eq_ignore_ascii_case(&token.swap_pool);
			if !(touches_escrow || touches_pool)
				|| receipts.contains_key(&log.transaction_hash)
			{
				continue;
			}
			match self.client.get_receipt(&log.transaction_hash).await {
				Ok(receipt) => {
					receipts.insert(log.transaction_hash.clone(), receipt);
				}
				Err(e) => warn!(
					"Receipt fetch failed for {}, skipping lifecycle correlation: {}",
					log.transaction_hash, e
				),
			}
		}
		receipts
	}

	/// Resolve block timestamps for the chunk's logs, best effort.
	async fn prefetch_timestamps(&self, logs: &[RawLog]) -> HashMap<u64, u64> {
		let mut by_height = HashMap::new();
		let mut requested: HashSet<&str> = HashSet::new();
		for log in logs {
			if !requested.insert(log.block_hash.as_str()) {
				continue;
			}
			match self.client.get_block(&log.block_hash).await {
				Ok(block) => {
					by_height.insert(block.number, block.timestamp);
				}
				Err(e) => debug!("Block fetch failed for {}: {}", log.block_hash, e),
			}
		}
		by_height
	}
}
