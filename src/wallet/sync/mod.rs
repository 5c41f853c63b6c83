//! Wallet Synchronization Module
//!
//! This module provides all the core logic and services for keeping a wallet's
//! transaction history and balances consistent with the ledger. It is composed
//! of several submodules, each responsible for a specific aspect of the sync
//! process:
//!
//! - `session`: The main entry point and coordinator. It wires together the caches, the subscription manager and the history scanner, and owns all sync state for its lifetime.
//! - `classifier`: Turns raw transfer logs into canonical wallet transactions, separating relay fees from primary transfers and correlating escrow and swap side effects.
//! - `cursor`: The pure reconciliation arithmetic of the backward scan; deciding when enough history has been seen is a fold over chunk results.
//! - `history`: The chunked backward scan driver, with the at-most-one-run guard per (address, token) pair.
//! - `subscriptions`: Keeps the live WebSocket transfer filter aligned with the watch set.
//! - `balance_cache`: Change detection over balance observations so the stores only see real updates.
//! - `progress_tracker`: Tracks scan progress and provides statistics.
//! - `stores`: Persistence traits and the file-backed implementations.

/// Change detection over balance observations
pub mod balance_cache;
/// Classification of raw transfer logs into transactions
pub mod classifier;
/// Reconciliation arithmetic of the backward scan
pub mod cursor;
/// Chunked backward history scan driver
pub mod history;
/// Tracks scan progress and statistics
pub mod progress_tracker;
/// Main coordinator for the wallet sync process
pub mod session;
/// Persistence traits and file-backed stores
pub mod stores;
/// Live transfer subscription management
pub mod subscriptions;

pub use session::*;
