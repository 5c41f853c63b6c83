//! Types for JSON-RPC ledger integration

use serde::{Deserialize, Serialize};

/// Hex-encoded account or contract address (`0x`-prefixed, lowercase).
pub type Address = String;
/// Hex-encoded transaction hash (`0x`-prefixed, lowercase).
pub type TxHash = String;

/// Largest token amount representable without losing integer precision in a
/// 53-bit float downstream. Tokens whose unit scale can exceed this must be
/// rejected by callers.
pub const MAX_SAFE_AMOUNT: u128 = (1 << 53) - 1;

/// Topic hash of the standard `Transfer(address,address,uint256)` event.
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Decoded indexed arguments of a transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferArgs {
    /// Sending account.
    pub from: Address,
    /// Receiving account.
    pub to: Address,
    /// Transferred amount in base units.
    pub value: u128,
}

/// One transfer-like event emission, as returned by a log query.
///
/// Many raw logs can belong to one transaction: a relay fee transfer and the
/// primary transfer share a transaction hash but occupy different log slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    /// The emitting token contract.
    pub address: Address,
    /// Hash of the transaction that emitted this log.
    #[serde(rename = "transactionHash")]
    pub transaction_hash: TxHash,
    /// Position of the log within its block.
    #[serde(rename = "logIndex")]
    pub log_index: u64,
    /// Decoded transfer arguments.
    pub args: TransferArgs,
    /// Hash of the containing block.
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    /// Height of the containing block.
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
}

/// An undecoded log carried inside a transaction receipt.
///
/// Receipts mix events from every contract the transaction touched, so
/// consumers decode these leniently and skip what they do not recognize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptLog {
    /// The emitting contract.
    pub address: Address,
    /// Indexed topics; `topics[0]` is the event signature hash.
    pub topics: Vec<String>,
    /// Hex-encoded non-indexed event data.
    pub data: String,
}

/// Transaction receipt with its inner logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: TxHash,
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
    pub logs: Vec<ReceiptLog>,
}

/// Block header fields the sync core needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    /// Unix timestamp of the block, in seconds.
    pub timestamp: u64,
}

/// Which indexed parameter a log query matches on.
///
/// The query model supports a single indexed-parameter match per call, so a
/// "from OR to" scan is always issued as two queries, one per side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSide {
    /// Match transfers whose `to` equals the address.
    Incoming(Address),
    /// Match transfers whose `from` equals the address.
    Outgoing(Address),
}

/// Error types for ledger RPC operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("No data returned")]
    NoData,

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed quantity: {0}")]
    QuantityError(String),
}

/// Parse a `0x`-prefixed hex quantity into a `u128`.
pub fn parse_quantity(raw: &str) -> Result<u128, LedgerError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::QuantityError(raw.to_string()))?;
    if digits.is_empty() {
        return Err(LedgerError::QuantityError(raw.to_string()));
    }
    u128::from_str_radix(digits, 16).map_err(|_| LedgerError::QuantityError(raw.to_string()))
}

/// Parse a `0x`-prefixed hex quantity into a `u64`.
pub fn parse_height(raw: &str) -> Result<u64, LedgerError> {
    let value = parse_quantity(raw)?;
    u64::try_from(value).map_err(|_| LedgerError::QuantityError(raw.to_string()))
}

/// Extract the address packed into a 32-byte indexed topic.
pub fn topic_to_address(topic: &str) -> Result<Address, LedgerError> {
    let digits = topic
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::QuantityError(topic.to_string()))?;
    if digits.len() != 64 {
        return Err(LedgerError::QuantityError(topic.to_string()));
    }
    Ok(format!("0x{}", digits[24..].to_ascii_lowercase()))
}

/// Decode the 32-byte words of a hex data field.
///
/// Returns `None` when the field is not a whole number of words; callers
/// treat that as an undecodable log and move on.
pub fn data_words(data: &str) -> Option<Vec<[u8; 32]>> {
    let digits = data.strip_prefix("0x")?;
    let bytes = hex::decode(digits).ok()?;
    if bytes.len() % 32 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut word = [0u8; 32];
                word.copy_from_slice(chunk);
                word
            })
            .collect(),
    )
}

/// Interpret a 32-byte word as an amount, rejecting values above `u128`.
pub fn word_to_amount(word: &[u8; 32]) -> Option<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut tail = [0u8; 16];
    tail.copy_from_slice(&word[16..]);
    Some(u128::from_be_bytes(tail))
}

/// Interpret a 32-byte word as a right-aligned address.
pub fn word_to_address(word: &[u8; 32]) -> Address {
    format!("0x{}", hex::encode(&word[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x2a").unwrap(), 42);
        assert!(parse_quantity("2a").is_err());
        assert!(parse_quantity("0x").is_err());
    }

    #[test]
    fn extracts_address_from_topic() {
        let topic = format!("0x{}{}", "0".repeat(24), "AB".repeat(20));
        assert_eq!(
            topic_to_address(&topic).unwrap(),
            format!("0x{}", "ab".repeat(20))
        );
        assert!(topic_to_address("0x1234").is_err());
    }

    #[test]
    fn decodes_data_words() {
        let mut word = [0u8; 32];
        word[31] = 7;
        let data = format!("0x{}", hex::encode(word));
        let words = data_words(&data).unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(word_to_amount(&words[0]).unwrap(), 7);

        // Truncated payloads are undecodable, not an error.
        assert!(data_words("0x0102").is_none());
    }

    #[test]
    fn amount_word_rejects_overflow() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(word_to_amount(&word).is_none());
    }
}
