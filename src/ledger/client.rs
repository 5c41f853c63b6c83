//!
//! JSON-RPC client for an account-based ledger node.
//!
//! This module provides the `LedgerClient` trait the sync core consumes and a
//! concrete implementation over HTTP JSON-RPC with a WebSocket channel for
//! live transfer-log subscriptions. All methods are async and designed for
//! use with Tokio.

use super::types::*;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, error, warn};

/// Stream of live transfer logs delivered by a node subscription.
pub type LogStream =
	std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<RawLog, LedgerError>> + Send>>;

/// Ledger query surface the sync core depends on.
///
/// Connection lifecycle, node selection and reconnection live behind this
/// trait; the core only issues bounded queries and point lookups.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
	/// Current chain height.
	async fn current_height(&self) -> Result<u64, LedgerError>;

	/// Transfer logs of one token contract in `[from_height, to_height]`,
	/// matched on a single indexed side.
	async fn query_transfer_logs(
		&self,
		token: &Address,
		side: &TransferSide,
		from_height: u64,
		to_height: u64,
	) -> Result<Vec<RawLog>, LedgerError>;

	/// Receipt of a mined transaction, with its inner logs.
	async fn get_receipt(&self, hash: &TxHash) -> Result<Receipt, LedgerError>;

	/// Header fields of a block, by block hash.
	async fn get_block(&self, block_hash: &str) -> Result<Block, LedgerError>;

	/// Native-coin balance of an account.
	async fn native_balance(&self, address: &Address) -> Result<u128, LedgerError>;

	/// Token balance of an account.
	async fn token_balance(&self, token: &Address, address: &Address)
	-> Result<u128, LedgerError>;

	/// Transaction count of an account.
	async fn nonce_of(&self, address: &Address) -> Result<u64, LedgerError>;

	/// Remaining allowance `owner` has granted to `spender` on `token`.
	async fn allowance(
		&self,
		token: &Address,
		owner: &Address,
		spender: &Address,
	) -> Result<u128, LedgerError>;

	/// Subscribe to live transfer logs of the given tokens whose recipient
	/// is one of `recipients`.
	async fn subscribe_transfers(
		&self,
		tokens: &[Address],
		recipients: &[Address],
	) -> Result<LogStream, LedgerError>;
}

// Selectors of the two read-only token calls the client issues.
const BALANCE_OF_SELECTOR: &str = "0x70a08231";
const ALLOWANCE_SELECTOR: &str = "0xdd62ed3e";

/// JSON-RPC ledger client
#[derive(Clone)]
pub struct JsonRpcLedgerClient {
	/// The underlying HTTP client for JSON-RPC requests.
	http_client: Client,
	/// The base URL for the node HTTP endpoint.
	rpc_url: String,
	/// The WebSocket URL for real-time subscriptions.
	ws_url: String,
}

impl JsonRpcLedgerClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `rpc_url` - The HTTP endpoint for JSON-RPC requests.
	/// * `ws_url` - The WebSocket endpoint for subscriptions.
	pub fn new(rpc_url: String, ws_url: String) -> Self {
		let http_client = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.expect("Failed to create HTTP client");

		Self {
			http_client,
			rpc_url,
			ws_url,
		}
	}

	/// Execute a JSON-RPC request.
	///
	/// Transport failures are retried with exponential backoff; an error
	/// object in the response body is surfaced immediately.
	async fn execute(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<serde_json::Value, LedgerError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": rand::rng().random::<u32>(),
			"method": method,
			"params": params,
		});

		let backoff_policy = ExponentialBackoff {
			max_elapsed_time: Some(Duration::from_secs(20)),
			..ExponentialBackoff::default()
		};

		let response_json = backoff::future::retry(backoff_policy, || async {
			let response = self
				.http_client
				.post(&self.rpc_url)
				.header("Content-Type", "application/json")
				.json(&request_body)
				.send()
				.await
				.map_err(|e| {
					warn!("RPC transport failure for {}: {}", method, e);
					backoff::Error::transient(LedgerError::HttpError(e))
				})?;

			if !response.status().is_success() {
				return Err(backoff::Error::transient(LedgerError::RpcError(format!(
					"HTTP error: {}",
					response.status()
				))));
			}

			let body: serde_json::Value = response
				.json()
				.await
				.map_err(|e| backoff::Error::transient(LedgerError::HttpError(e)))?;

			if let Some(rpc_error) = body.get("error") {
				// The node answered; retrying the same request will not help.
				return Err(backoff::Error::permanent(LedgerError::RpcError(
					rpc_error.to_string(),
				)));
			}

			Ok(body)
		})
		.await?;

		response_json
			.get("result")
			.cloned()
			.ok_or(LedgerError::NoData)
	}

	fn log_filter(token: &Address, side: &TransferSide) -> serde_json::Value {
		// One indexed parameter per query; the unmatched side stays null.
		let (from_topic, to_topic) = match side {
			TransferSide::Outgoing(address) => (Some(address_topic(address)), None),
			TransferSide::Incoming(address) => (None, Some(address_topic(address))),
		};
		json!({
			"address": token,
			"topics": [TRANSFER_TOPIC, from_topic, to_topic],
		})
	}

	/// Padded call data for a one-address read call.
	fn call_data_one(selector: &str, address: &Address) -> String {
		format!("{}{}", selector, pad_address(address))
	}

	/// Padded call data for a two-address read call.
	fn call_data_two(selector: &str, first: &Address, second: &Address) -> String {
		format!("{}{}{}", selector, pad_address(first), pad_address(second))
	}

	async fn eth_call_quantity(
		&self,
		contract: &Address,
		data: String,
	) -> Result<u128, LedgerError> {
		let result = self
			.execute("eth_call", json!([{"to": contract, "data": data}, "latest"]))
			.await?;
		let raw = result.as_str().ok_or(LedgerError::NoData)?;
		// Read calls return one 32-byte word.
		parse_quantity(raw)
	}
}

#[async_trait::async_trait]
impl LedgerClient for JsonRpcLedgerClient {
	async fn current_height(&self) -> Result<u64, LedgerError> {
		let result = self.execute("eth_blockNumber", json!([])).await?;
		parse_height(result.as_str().ok_or(LedgerError::NoData)?)
	}

	async fn query_transfer_logs(
		&self,
		token: &Address,
		side: &TransferSide,
		from_height: u64,
		to_height: u64,
	) -> Result<Vec<RawLog>, LedgerError> {
		let mut filter = Self::log_filter(token, side);
		filter["fromBlock"] = json!(format!("{:#x}", from_height));
		filter["toBlock"] = json!(format!("{:#x}", to_height));

		let result = self.execute("eth_getLogs", json!([filter])).await?;
		let entries = result.as_array().ok_or(LedgerError::NoData)?;

		let mut logs = Vec::with_capacity(entries.len());
		for entry in entries {
			logs.push(decode_log_entry(entry)?);
		}
		debug!(
			"Fetched {} transfer logs for {:?} in [{}, {}]",
			logs.len(),
			side,
			from_height,
			to_height
		);
		Ok(logs)
	}

	async fn get_receipt(&self, hash: &TxHash) -> Result<Receipt, LedgerError> {
		let result = self
			.execute("eth_getTransactionReceipt", json!([hash]))
			.await?;
		if result.is_null() {
			return Err(LedgerError::NoData);
		}

		let logs = result
			.get("logs")
			.and_then(|l| l.as_array())
			.ok_or(LedgerError::NoData)?
			.iter()
			.map(|entry| {
				let topics = entry
					.get("topics")
					.and_then(|t| t.as_array())
					.map(|t| {
						t.iter()
							.filter_map(|topic| topic.as_str())
							.map(|topic| topic.to_ascii_lowercase())
							.collect()
					})
					.unwrap_or_default();
				ReceiptLog {
					address: field_address(entry, "address").unwrap_or_default(),
					topics,
					data: entry
						.get("data")
						.and_then(|d| d.as_str())
						.unwrap_or("0x")
						.to_string(),
				}
			})
			.collect();

		Ok(Receipt {
			transaction_hash: field_address(&result, "transactionHash")
				.ok_or(LedgerError::NoData)?,
			block_number: parse_height(
				result
					.get("blockNumber")
					.and_then(|n| n.as_str())
					.ok_or(LedgerError::NoData)?,
			)?,
			logs,
		})
	}

	async fn get_block(&self, block_hash: &str) -> Result<Block, LedgerError> {
		let result = self
			.execute("eth_getBlockByHash", json!([block_hash, false]))
			.await?;
		if result.is_null() {
			return Err(LedgerError::NoData);
		}
		let number = parse_height(
			result
				.get("number")
				.and_then(|n| n.as_str())
				.ok_or(LedgerError::NoData)?,
		)?;
		let timestamp = parse_quantity(
			result
				.get("timestamp")
				.and_then(|t| t.as_str())
				.ok_or(LedgerError::NoData)?,
		)? as u64;
		Ok(Block { number, timestamp })
	}

	async fn native_balance(&self, address: &Address) -> Result<u128, LedgerError> {
		let result = self
			.execute("eth_getBalance", json!([address, "latest"]))
			.await?;
		parse_quantity(result.as_str().ok_or(LedgerError::NoData)?)
	}

	async fn token_balance(
		&self,
		token: &Address,
		address: &Address,
	) -> Result<u128, LedgerError> {
		self.eth_call_quantity(token, Self::call_data_one(BALANCE_OF_SELECTOR, address))
			.await
	}

	async fn nonce_of(&self, address: &Address) -> Result<u64, LedgerError> {
		let result = self
			.execute("eth_getTransactionCount", json!([address, "latest"]))
			.await?;
		parse_height(result.as_str().ok_or(LedgerError::NoData)?)
	}

	async fn allowance(
		&self,
		token: &Address,
		owner: &Address,
		spender: &Address,
	) -> Result<u128, LedgerError> {
		self.eth_call_quantity(token, Self::call_data_two(ALLOWANCE_SELECTOR, owner, spender))
			.await
	}

	async fn subscribe_transfers(
		&self,
		tokens: &[Address],
		recipients: &[Address],
	) -> Result<LogStream, LedgerError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		let request = self.ws_url.clone().into_client_request()?;
		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let recipient_topics: Vec<String> = recipients.iter().map(address_topic).collect();
		let subscribe_message = json!({
			"jsonrpc": "2.0",
			"id": rand::rng().random::<u32>(),
			"method": "eth_subscribe",
			"params": ["logs", {
				"address": tokens,
				"topics": [TRANSFER_TOPIC, serde_json::Value::Null, recipient_topics],
			}],
		});
		ws_sender
			.send(Message::Text(subscribe_message.to_string()))
			.await?;

		// Wait for the subscription id before handing out the stream.
		if let Some(msg) = ws_receiver.next().await {
			match msg? {
				Message::Text(text) => {
					let parsed: serde_json::Value = serde_json::from_str(&text)?;
					if parsed.get("result").and_then(|r| r.as_str()).is_none() {
						return Err(LedgerError::RpcError(format!(
							"Subscription not acknowledged: {}",
							text
						)));
					}
				}
				_ => {
					return Err(LedgerError::RpcError(
						"Unexpected message type during subscription handshake".to_string(),
					));
				}
			}
		}

		// Return stream of transfer logs
		let stream = ws_receiver.filter_map(|msg| async move {
			match msg {
				Ok(Message::Text(text)) => {
					match serde_json::from_str::<serde_json::Value>(&text) {
						Ok(parsed) => {
							if parsed.get("method").and_then(|m| m.as_str())
								!= Some("eth_subscription")
							{
								debug!("Ignoring non-subscription message");
								return None;
							}
							let entry = parsed
								.get("params")
								.and_then(|p| p.get("result"))
								.cloned();
							match entry {
								Some(entry) => match decode_log_entry(&entry) {
									Ok(log) => Some(Ok(log)),
									Err(e) => {
										error!("Failed to decode subscription log: {}", e);
										Some(Err(e))
									}
								},
								None => Some(Err(LedgerError::NoData)),
							}
						}
						Err(e) => Some(Err(LedgerError::JsonError(e))),
					}
				}
				Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
				Ok(Message::Close(_)) => None,
				Ok(_) => Some(Err(LedgerError::RpcError(
					"Unexpected message type".to_string(),
				))),
				Err(e) => Some(Err(LedgerError::WebSocketError(e))),
			}
		});

		Ok(Box::pin(stream))
	}
}

/// Decode one wire log entry into a `RawLog`.
///
/// Topics carry the indexed sender and recipient, the data field the amount.
fn decode_log_entry(entry: &serde_json::Value) -> Result<RawLog, LedgerError> {
	let topics: Vec<&str> = entry
		.get("topics")
		.and_then(|t| t.as_array())
		.ok_or(LedgerError::NoData)?
		.iter()
		.filter_map(|topic| topic.as_str())
		.collect();
	if topics.len() < 3 || !topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
		return Err(LedgerError::RpcError(format!(
			"Log is not a transfer event: {:?}",
			topics.first()
		)));
	}

	let data = entry
		.get("data")
		.and_then(|d| d.as_str())
		.ok_or(LedgerError::NoData)?;
	let words = data_words(data)
		.ok_or_else(|| LedgerError::QuantityError(data.to_string()))?;
	let value = words
		.first()
		.and_then(word_to_amount)
		.ok_or_else(|| LedgerError::QuantityError(data.to_string()))?;

	Ok(RawLog {
		address: field_address(entry, "address").ok_or(LedgerError::NoData)?,
		transaction_hash: field_address(entry, "transactionHash").ok_or(LedgerError::NoData)?,
		log_index: parse_height(
			entry
				.get("logIndex")
				.and_then(|i| i.as_str())
				.ok_or(LedgerError::NoData)?,
		)?,
		args: TransferArgs {
			from: topic_to_address(topics[1])?,
			to: topic_to_address(topics[2])?,
			value,
		},
		block_hash: field_address(entry, "blockHash").ok_or(LedgerError::NoData)?,
		block_number: parse_height(
			entry
				.get("blockNumber")
				.and_then(|n| n.as_str())
				.ok_or(LedgerError::NoData)?,
		)?,
	})
}

fn field_address(entry: &serde_json::Value, field: &str) -> Option<String> {
	entry
		.get(field)
		.and_then(|v| v.as_str())
		.map(|v| v.to_ascii_lowercase())
}

fn pad_address(address: &Address) -> String {
	let digits = address.strip_prefix("0x").unwrap_or(address);
	format!("{:0>64}", digits.to_ascii_lowercase())
}

fn address_topic(address: &Address) -> String {
	format!("0x{}", pad_address(address))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn transfer_entry(value_word: &str) -> serde_json::Value {
		json!({
			"address": "0xAAAA000000000000000000000000000000000001",
			"transactionHash": "0xF00D000000000000000000000000000000000000000000000000000000000001",
			"logIndex": "0x2",
			"blockHash": "0xb10c000000000000000000000000000000000000000000000000000000000001",
			"blockNumber": "0x10",
			"topics": [
				TRANSFER_TOPIC,
				address_topic(&"0x1111111111111111111111111111111111111111".to_string()),
				address_topic(&"0x2222222222222222222222222222222222222222".to_string()),
			],
			"data": value_word,
		})
	}

	#[test]
	fn decodes_wire_log() {
		let entry = transfer_entry(&format!("0x{:0>64}", "3e8"));
		let log = decode_log_entry(&entry).unwrap();
		assert_eq!(log.args.from, "0x1111111111111111111111111111111111111111");
		assert_eq!(log.args.to, "0x2222222222222222222222222222222222222222");
		assert_eq!(log.args.value, 1000);
		assert_eq!(log.log_index, 2);
		assert_eq!(log.block_number, 16);
		// Hashes come back normalized to lowercase.
		assert!(log.transaction_hash.starts_with("0xf00d"));
	}

	#[test]
	fn rejects_non_transfer_log() {
		let mut entry = transfer_entry(&format!("0x{:0>64}", "1"));
		entry["topics"][0] = json!("0x1234000000000000000000000000000000000000000000000000000000000000");
		assert!(decode_log_entry(&entry).is_err());
	}

	#[test]
	fn pads_call_data() {
		let data = JsonRpcLedgerClient::call_data_one(
			BALANCE_OF_SELECTOR,
			&"0xAb01000000000000000000000000000000000002".to_string(),
		);
		assert_eq!(data.len(), 10 + 64);
		assert!(data.starts_with("0x70a08231"));
		assert!(data.ends_with("ab01000000000000000000000000000000000002"));
	}
}
