//! Fee-relay selection surface.
//!
//! Relay discovery and the marketplace algorithm live outside the sync core;
//! the core only needs to pick a relay given a cost function, and to know the
//! pool address relay fees are paid to so fee logs can be recognized.

use crate::ledger::Address;
use tracing::debug;

/// A gas-paying intermediary that submits meta-transactions for a fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
	/// Pool address relay fees are transferred to.
	pub pool_address: Address,
	/// Submission endpoint of the relay.
	pub url: String,
	/// Advertised fee, in parts per million of the transferred value.
	pub fee_ppm: u64,
}

/// Picks a relay given a caller-supplied cost function.
pub trait RelaySelector: Send + Sync {
	/// Select the relay minimizing `cost`, or `None` when no relay is known.
	fn select_relay(&self, cost: &dyn Fn(&RelayInfo) -> u128) -> Option<RelayInfo>;
}

/// Selector over a fixed list of known relays.
pub struct StaticRelayList {
	relays: Vec<RelayInfo>,
}

impl StaticRelayList {
	pub fn new(relays: Vec<RelayInfo>) -> Self {
		Self { relays }
	}
}

impl RelaySelector for StaticRelayList {
	fn select_relay(&self, cost: &dyn Fn(&RelayInfo) -> u128) -> Option<RelayInfo> {
		let selected = self.relays.iter().min_by_key(|relay| cost(relay)).cloned();
		if let Some(relay) = &selected {
			debug!("Selected relay {} (pool {})", relay.url, relay.pool_address);
		}
		selected
	}
}
