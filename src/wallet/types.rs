use crate::ledger::{Address, LedgerError, TxHash};

use serde::{Deserialize, Serialize};

/// Which token deployment a balance or transaction belongs to.
///
/// A closed set: the wallet tracks the chain-native token representation and
/// the bridged one, each with its own contract addresses and fee collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenVariant {
	/// Token minted natively on this chain.
	Native,
	/// Token bridged in from the home chain.
	Bridged,
}

/// Per-variant contract addresses and unit scale.
#[derive(Debug, Clone)]
pub struct TokenConfig {
	pub variant: TokenVariant,
	/// The token contract emitting transfer events.
	pub contract: Address,
	pub decimals: u32,
	/// Addresses relay fees are paid to. The first entry is the active
	/// relay pool; the rest are legacy collectors kept for transactions
	/// made against older contract versions.
	pub fee_collectors: Vec<Address>,
	/// Hashed-timelock escrow contract mediating atomic swaps.
	pub escrow_contract: Address,
	/// Swap pool exchanging this token against its counterpart.
	pub swap_pool: Address,
}

impl TokenConfig {
	pub fn is_fee_collector(&self, address: &str) -> bool {
		self.fee_collectors
			.iter()
			.any(|collector| collector.eq_ignore_ascii_case(address))
	}

	/// Counterparty contracts an allowance can be outstanding against.
	pub fn allowance_spenders(&self) -> Vec<Address> {
		vec![self.escrow_contract.clone(), self.swap_pool.clone()]
	}
}

/// Confirmation state of a wallet transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
	/// Submitted but not yet included in a block
	Pending,
	/// Included in a block and executed
	Mined,
	/// The relay fee was charged but the intended transfer never executed
	Failed,
}

/// Escrow or swap side effect correlated to a transaction by its hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
	/// An escrow was funded.
	Open {
		id: String,
		token: Address,
		amount: u128,
		recipient: Address,
		hash: String,
		timeout: u64,
	},
	/// The escrow counterparty revealed the secret and collected.
	Redeem { id: String, secret: String },
	/// The escrow timed out and the funds went back.
	Refund { id: String },
	/// Both legs of a pool swap.
	Swap { amount_in: u128, amount_out: u128 },
}

/// Canonical wallet transaction record.
///
/// One record per transaction hash, even when several raw logs contributed
/// to it (a fee transfer and the primary transfer, for instance). Updated by
/// wholesale replacement keyed on the hash, never field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub token: TokenVariant,
	pub transaction_hash: TxHash,
	pub log_index: u64,
	pub sender: Address,
	pub recipient: Address,
	/// Transferred amount in base units.
	pub value: u128,
	/// Relay fee paid alongside the transfer, when one was matched.
	pub fee: Option<u128>,
	/// Escrow or swap side effect, when one was correlated.
	pub event: Option<LifecycleEvent>,
	pub state: TxState,
	pub block_height: Option<u64>,
	/// Unix timestamp of the containing block, in seconds.
	pub timestamp: Option<u64>,
}

/// Error types for wallet synchronization
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),

	#[error("Classification error: {0}")]
	Classify(String),

	#[error("Store error: {0}")]
	Store(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Sync error: {0}")]
	Sync(String),
}
