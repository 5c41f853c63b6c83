//! Ledger node integration module
//!
//! This module provides the client trait and types for talking to an
//! account-based ledger node over JSON-RPC. The sync core consumes only the
//! `LedgerClient` trait: bounded log queries, point lookups for receipts,
//! blocks and account state, and a live transfer-log subscription.

/// JSON-RPC client and the `LedgerClient` trait
mod client;
/// Type definitions for ledger data structures
mod types;

pub use client::{JsonRpcLedgerClient, LedgerClient, LogStream};
pub use types::*;
