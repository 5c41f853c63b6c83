//! Session wiring for one wallet process.
//!
//! A `SyncSession` owns every piece of sync state for its lifetime: the
//! balance cache, the live subscription manager, the history fetch markers
//! and the in-flight run counter. Nothing here is global, so two sessions
//! in one process stay fully independent and teardown is dropping the
//! session.

use crate::ledger::{Address, LedgerClient, RawLog, Receipt, TxHash};
use crate::relay::RelaySelector;
use crate::wallet::sync::balance_cache::BalanceCache;
use crate::wallet::sync::classifier::EventClassifier;
use crate::wallet::sync::history::{FetchMarkers, HistorySync, SyncConfig};
use crate::wallet::sync::stores::{AddressStore, TransactionStore};
use crate::wallet::types::{TokenConfig, WalletSyncError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::subscriptions::SubscriptionManager;

pub struct SyncSession {
    inner: Arc<SessionInner>,
    listener: JoinHandle<()>,
}

struct SessionInner {
    client: Arc<dyn LedgerClient>,
    tx_store: Arc<dyn TransactionStore>,
    tokens: Vec<TokenConfig>,
    balance_cache: Arc<BalanceCache>,
    subscriptions: SubscriptionManager,
    history: Arc<HistorySync>,
    in_flight: Arc<AtomicUsize>,
}

impl SyncSession {
    /// Build a session over the given ledger client and stores.
    ///
    /// The relay chosen by `relay_selector` collects fees for this session,
    /// so its pool address is prepended to every token's collector list and
    /// takes precedence during fee classification. Collectors configured on
    /// the tokens stay recognized for transactions that predate the switch.
    pub fn new(
        client: Arc<dyn LedgerClient>,
        tx_store: Arc<dyn TransactionStore>,
        addr_store: Arc<dyn AddressStore>,
        mut tokens: Vec<TokenConfig>,
        relay_selector: Arc<dyn RelaySelector>,
        config: SyncConfig,
    ) -> Self {
        if let Some(relay) = relay_selector.select_relay(&|info| u128::from(info.fee_ppm)) {
            info!("Selected fee relay {} ({})", relay.pool_address, relay.url);
            for token in &mut tokens {
                token.fee_collectors.insert(0, relay.pool_address.clone());
            }
        } else {
            warn!("No relay available, keeping configured fee collectors only");
        }

        let contracts: Vec<Address> =
            tokens.iter().map(|token| token.contract.clone()).collect();
        let balance_cache = Arc::new(BalanceCache::new(
            client.clone(),
            addr_store,
            contracts.clone(),
        ));
        let markers = Arc::new(FetchMarkers::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let history = Arc::new(HistorySync::new(
            client.clone(),
            tx_store.clone(),
            markers.clone(),
            in_flight.clone(),
            config,
        ));

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let subscriptions = SubscriptionManager::new(
            client.clone(),
            contracts,
            balance_cache.clone(),
            markers,
            sender,
        );

        let inner = Arc::new(SessionInner {
            client,
            tx_store,
            tokens,
            balance_cache,
            subscriptions,
            history,
            in_flight,
        });

        let listener_inner = inner.clone();
        let listener = tokio::spawn(async move {
            while let Some(log) = receiver.recv().await {
                listener_inner.on_incoming_transfer_event(log).await;
            }
        });

        Self { inner, listener }
    }

    /// Apply a changed watch set and kick off history syncs for every
    /// newly watched address, one run per token variant.
    pub async fn on_watch_set_changed(
        &self,
        current: &[Address],
    ) -> Result<(), WalletSyncError> {
        let outcome = self.inner.subscriptions.reconcile(current).await?;

        for address in outcome.added {
            for token in &self.inner.tokens {
                let history = self.inner.history.clone();
                let token = token.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    history.sync(&address, &token).await;
                });
            }
        }
        Ok(())
    }

    /// Handle one live transfer delivered outside the subscription stream,
    /// for callers that poll or receive logs through another channel.
    pub async fn on_incoming_transfer_event(&self, log: RawLog) {
        self.inner.on_incoming_transfer_event(log).await;
    }

    /// Number of history sync runs currently in flight.
    pub fn history_sync_progress(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl SessionInner {
    /// Classify and persist one live transfer log, then refresh the
    /// recipient's balances. Errors end the event, not the listener.
    async fn on_incoming_transfer_event(&self, log: RawLog) {
        if log.args.value == 0 {
            debug!("Ignoring zero-value transfer {}", log.transaction_hash);
            return;
        }

        let Some(token) = self
            .tokens
            .iter()
            .find(|token| token.contract.eq_ignore_ascii_case(&log.address))
        else {
            warn!("Live log from unknown token contract {}", log.address);
            return;
        };

        let recipient = log.args.to.clone();
        let known = match self.tx_store.known_hashes(&recipient).await {
            Ok(known) => known,
            Err(e) => {
                warn!("Could not load known hashes for {}: {}", recipient, e);
                return;
            }
        };
        if known.contains(&log.transaction_hash) {
            debug!("Live transfer {} already recorded", log.transaction_hash);
            return;
        }

        let receipts = self.maybe_fetch_receipt(&log, token).await;
        let classifier = EventClassifier::new(token.clone());
        let mut transactions = match classifier.classify(
            std::slice::from_ref(&log),
            &receipts,
            &known,
        ) {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!("Dropping live transfer {}: {}", log.transaction_hash, e);
                return;
            }
        };

        if let Ok(block) = self.client.get_block(&log.block_hash).await {
            for transaction in &mut transactions {
                transaction.timestamp = Some(block.timestamp);
            }
        }

        if let Err(e) = self.tx_store.add_transactions(&recipient, &transactions).await {
            warn!("Could not persist live transfer {}: {}", log.transaction_hash, e);
            return;
        }
        info!(
            "Recorded live transfer {} to {}",
            log.transaction_hash, recipient
        );

        if let Err(e) = self
            .balance_cache
            .refresh(std::slice::from_ref(&recipient))
            .await
        {
            warn!("Balance refresh failed for {}: {}", recipient, e);
        }
    }

    /// Lifecycle correlation needs the receipt only when the transfer
    /// touches the escrow contract or the swap pool.
    async fn maybe_fetch_receipt(
        &self,
        log: &RawLog,
        token: &TokenConfig,
    ) -> HashMap<TxHash, Receipt> {
        let mut receipts = HashMap::new();
        let touches = log.args.to.eq_ignore_ascii_case(&token.escrow_contract)
            || log.args.from.eq_ignore_ascii_case(&token.escrow_contract)
            || log.args.to.eq_ignore_ascii_case(&token.swap_pool);
        if touches {
            match self.client.get_receipt(&log.transaction_hash).await {
                Ok(receipt) => {
                    receipts.insert(log.transaction_hash.clone(), receipt);
                }
                Err(e) => warn!(
                    "Receipt fetch failed for live transfer {}: {}",
                    log.transaction_hash, e
                ),
            }
        }
        receipts
    }
}
