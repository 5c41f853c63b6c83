//! Semantic classification of raw transfer logs.
//!
//! The classifier turns one batch of transfer logs into canonical wallet
//! transactions. Logs are grouped by transaction hash; within a group the
//! relay fee transfer is told apart from the primary transfer, and escrow or
//! swap side effects are correlated from the transaction receipt's inner
//! logs. At most one record is emitted per transaction hash.

use crate::ledger::{
	MAX_SAFE_AMOUNT, RawLog, Receipt, ReceiptLog, TRANSFER_TOPIC, TxHash, data_words,
	topic_to_address, word_to_address, word_to_amount,
};
use crate::wallet::types::{LifecycleEvent, TokenConfig, Transaction, TxState, WalletSyncError};

use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Signature topic of the escrow `Open(bytes32,address,uint256,address,bytes32,uint256)` event.
pub const ESCROW_OPEN_TOPIC: &str =
	"0x6ed79a08bf97a4db0b893a0d7ca1a4db6dca4a2b3ba8a90d0f65ea4c1f211b0e";
/// Signature topic of the escrow `Redeem(bytes32,bytes32)` event.
pub const ESCROW_REDEEM_TOPIC: &str =
	"0x419a54a2c5188a1db3a41fbc7f17a4a0425c101a9b0cbee5ae3b12a969a9e0b4";
/// Signature topic of the escrow `Refund(bytes32)` event.
pub const ESCROW_REFUND_TOPIC: &str =
	"0x3d32a1b9fc04ff79c1c1a6d0e9c10cbfbb9a8e3cc3e4fd7a1f6d5e02c98a44e7";

/// Groups transfer logs by transaction and assigns semantic roles.
#[derive(Clone)]
pub struct EventClassifier {
	config: TokenConfig,
}

impl EventClassifier {
	pub fn new(config: TokenConfig) -> Self {
		Self { config }
	}

	/// Classify a batch of raw logs into canonical transactions.
	///
	/// `receipts_by_hash` carries prefetched receipts for transactions that
	/// touch the escrow contract or the swap pool; a missing entry simply
	/// means the side-effect enrichment is skipped. Transactions whose hash
	/// is in `known_hashes` emit nothing, though their logs still take part
	/// in fee and lifecycle correlation within the batch. Output ordering is
	/// not meaningful; callers key results by transaction hash.
	pub fn classify(
		&self,
		logs: &[RawLog],
		receipts_by_hash: &HashMap<TxHash, Receipt>,
		known_hashes: &HashSet<TxHash>,
	) -> Result<Vec<Transaction>, WalletSyncError> {
		let groups = logs
			.iter()
			.filter(|log| {
				// Address-poisoning transfers carry exactly zero value.
				if log.args.value == 0 {
					debug!(
						"Discarding zero-value transfer in {}",
						log.transaction_hash
					);
					false
				} else {
					true
				}
			})
			.into_group_map_by(|log| log.transaction_hash.clone());

		let mut transactions = Vec::with_capacity(groups.len());
		for (hash, mut group) in groups {
			group.sort_by_key(|log| log.log_index);

			if let Some(log) = group.iter().find(|log| log.args.value > MAX_SAFE_AMOUNT) {
				return Err(WalletSyncError::Classify(format!(
					"transfer value {} in {} exceeds the safe amount bound",
					log.args.value, hash
				)));
			}

			let fee_log = group
				.iter()
				.find(|log| self.config.is_fee_collector(&log.args.to))
				.copied();
			let primary = group
				.iter()
				.find(|log| !self.config.is_fee_collector(&log.args.to))
				.copied();

			let record = match (primary, fee_log) {
				(Some(primary), fee_log) => {
					let event = self.correlate_lifecycle(primary, receipts_by_hash.get(&hash));
					Transaction {
						token: self.config.variant,
						transaction_hash: hash.clone(),
						log_index: primary.log_index,
						sender: primary.args.from.clone(),
						recipient: primary.args.to.clone(),
						value: primary.args.value,
						fee: fee_log.map(|log| log.args.value),
						event,
						state: TxState::Mined,
						block_height: Some(primary.block_number),
						timestamp: None,
					}
				}
				// Fee charged but the intended transfer never executed: the
				// fee log itself becomes the synthetic record.
				(None, Some(fee_log)) => Transaction {
					token: self.config.variant,
					transaction_hash: hash.clone(),
					log_index: fee_log.log_index,
					sender: fee_log.args.from.clone(),
					recipient: fee_log.args.to.clone(),
					value: fee_log.args.value,
					fee: None,
					event: None,
					state: TxState::Failed,
					block_height: Some(fee_log.block_number),
					timestamp: None,
				},
				(None, None) => {
					return Err(WalletSyncError::Classify(format!(
						"transaction {} has neither a transfer nor a fee log",
						hash
					)));
				}
			};

			if known_hashes.contains(&hash) {
				debug!("Skipping already known transaction {}", hash);
				continue;
			}
			transactions.push(record);
		}

		Ok(transactions)
	}

	/// Correlate an escrow or swap side effect from the receipt's inner logs.
	///
	/// Best-effort: a missing receipt or an undecodable inner log yields no
	/// event, never a failure of the primary transaction.
	fn correlate_lifecycle(
		&self,
		primary: &RawLog,
		receipt: Option<&Receipt>,
	) -> Option<LifecycleEvent> {
		let escrow = &self.config.escrow_contract;
		if primary.args.to.eq_ignore_ascii_case(escrow)
			|| primary.args.from.eq_ignore_ascii_case(escrow)
		{
			// Receipts carry unrelated logs; undecodable candidates are
			// skipped and the next one tried.
			return receipt?
				.logs
				.iter()
				.filter(|log| log.address.eq_ignore_ascii_case(escrow))
				.filter_map(decode_escrow_event)
				.next();
		}

		let pool = &self.config.swap_pool;
		if primary.args.to.eq_ignore_ascii_case(pool) {
			let amount_out = receipt?
				.logs
				.iter()
				.filter_map(decode_transfer_leg)
				.find(|(from, to, _)| {
					from.eq_ignore_ascii_case(pool) && to.eq_ignore_ascii_case(&primary.args.from)
				})
				.map(|(_, _, value)| value)?;
			return Some(LifecycleEvent::Swap {
				amount_in: primary.args.value,
				amount_out,
			});
		}

		None
	}
}

/// Decode one escrow-contract inner log, or `None` when it is not one of the
/// known lifecycle events or its payload does not fit the expected shape.
fn decode_escrow_event(log: &ReceiptLog) -> Option<LifecycleEvent> {
	let signature = log.topics.first()?;
	if signature.eq_ignore_ascii_case(ESCROW_OPEN_TOPIC) {
		let id = log.topics.get(1)?.clone();
		let words = data_words(&log.data)?;
		if words.len() < 5 {
			return None;
		}
		Some(LifecycleEvent::Open {
			id,
			token: word_to_address(&words[0]),
			amount: word_to_amount(&words[1])?,
			recipient: word_to_address(&words[2]),
			hash: format!("0x{}", hex::encode(words[3])),
			timeout: u64::try_from(word_to_amount(&words[4])?).ok()?,
		})
	} else if signature.eq_ignore_ascii_case(ESCROW_REDEEM_TOPIC) {
		let id = log.topics.get(1)?.clone();
		let words = data_words(&log.data)?;
		let secret = format!("0x{}", hex::encode(words.first()?));
		Some(LifecycleEvent::Redeem { id, secret })
	} else if signature.eq_ignore_ascii_case(ESCROW_REFUND_TOPIC) {
		let id = log.topics.get(1)?.clone();
		Some(LifecycleEvent::Refund { id })
	} else {
		None
	}
}

/// Decode an inner log as a token transfer leg `(from, to, value)`.
fn decode_transfer_leg(log: &ReceiptLog) -> Option<(String, String, u128)> {
	if !log.topics.first()?.eq_ignore_ascii_case(TRANSFER_TOPIC) {
		return None;
	}
	let from = topic_to_address(log.topics.get(1)?).ok()?;
	let to = topic_to_address(log.topics.get(2)?).ok()?;
	let value = data_words(&log.data)?.first().and_then(word_to_amount)?;
	Some((from, to, value))
}
