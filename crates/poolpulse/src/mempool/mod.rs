//! Mempool tracker: pending-swap detection and per-transaction lifecycle.
//!
//! Watches `newPendingTransactions`, classifies calldata by method selector
//! against the monitored pool set, and walks each matched transaction through
//! pending → confirmed / failed / replaced / timedOut. Per-transaction
//! failures never tear down the subscription; the mempool is noisy by nature.

pub mod decode;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use lru::LruCache;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::abi;
use crate::chain::{ChainClient, TransactionReceipt};
use crate::confirm::{ConfirmEmitter, ConfirmedEnvelope, FailedEnvelope};
use crate::constants::{self, addr_key};
use crate::errors::{FeedError, Result};
use crate::metrics::Metrics;
use crate::types::{
    parse_address, LogEvent, Pair, PendingSwap, Pool, PoolKind, Protocol, SwapListenerSpec,
    SwapOperation, SwapStatus,
};

use decode::{decode_pending, PendingCall};

/// Concurrent in-flight classification fetches.
const CLASSIFY_PERMITS: usize = 32;

/// An active mempool listener for one token/pool pair.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapListener {
    pub token_address: String,
    pub pool_address: String,
    pub protocol: String,
    pub pair_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
    pub is_token0: bool,
    pub started_at: String,
}

struct PendingEntry {
    swap: PendingSwap,
    from: Address,
    nonce: U256,
    kind: PoolKind,
    is_token0: bool,
    user_filter: Option<Address>,
}

pub struct MempoolTracker {
    chain: Arc<ChainClient>,
    confirm: Arc<ConfirmEmitter>,
    metrics: Arc<Metrics>,
    pending_timeout: Duration,
    dedup_size: usize,
    /// token key → listener.
    listeners: RwLock<HashMap<String, SwapListener>>,
    /// pool key → token key.
    pool_index: RwLock<HashMap<String, String>>,
    /// tracked transactions.
    table: Mutex<HashMap<B256, PendingEntry>>,
    /// (from, nonce) → tracked hash, for replacement detection.
    by_sender: Mutex<HashMap<(Address, U256), B256>>,
    classify_limit: Arc<Semaphore>,
}

impl MempoolTracker {
    pub fn new(
        chain: Arc<ChainClient>,
        confirm: Arc<ConfirmEmitter>,
        metrics: Arc<Metrics>,
        pending_timeout: Duration,
        dedup_size: usize,
    ) -> Self {
        Self {
            chain,
            confirm,
            metrics,
            pending_timeout,
            dedup_size,
            listeners: RwLock::new(HashMap::new()),
            pool_index: RwLock::new(HashMap::new()),
            table: Mutex::new(HashMap::new()),
            by_sender: Mutex::new(HashMap::new()),
            classify_limit: Arc::new(Semaphore::new(CLASSIFY_PERMITS)),
        }
    }

    // -- Listener surface ---------------------------------------------------

    /// Start tracking swaps for a token/pool pair. Validates that the token
    /// is actually a member of the pool.
    pub async fn start_swap_listener(&self, spec: &SwapListenerSpec) -> Result<SwapListener> {
        let token = parse_address(&spec.token_address)?;
        let pool = parse_address(&spec.pool_address)?;
        let protocol = Protocol::from_tag(&spec.protocol)?;
        let user = spec
            .user_address
            .as_deref()
            .map(parse_address)
            .transpose()?;
        // Pair tag is carried through to envelopes; validate its shape even
        // though tracking itself does not price anything.
        Pair::from_spec(&spec.pair_type, Some(Address::ZERO))?;

        let token0 = self.read_pool_token(pool, constants::SEL_TOKEN0).await?;
        let token1 = self.read_pool_token(pool, constants::SEL_TOKEN1).await?;
        let is_token0 = if token == token0 {
            true
        } else if token == token1 {
            false
        } else {
            return Err(FeedError::TokenNotInPool {
                token: addr_key(&token),
                pool: addr_key(&pool),
            });
        };

        let listener = SwapListener {
            token_address: addr_key(&token),
            pool_address: addr_key(&pool),
            protocol: protocol.tag().to_string(),
            pair_type: spec.pair_type.to_ascii_uppercase(),
            user_address: user.as_ref().map(addr_key),
            is_token0,
            started_at: chrono::Utc::now().to_rfc3339(),
        };

        self.pool_index
            .write()
            .await
            .insert(listener.pool_address.clone(), listener.token_address.clone());
        self.listeners
            .write()
            .await
            .insert(listener.token_address.clone(), listener.clone());

        info!(
            token = %listener.token_address,
            pool = %listener.pool_address,
            protocol = %listener.protocol,
            "swap listener started"
        );
        Ok(listener)
    }

    pub async fn stop_swap_listener(&self, token: Address) -> bool {
        self.remove_pools_for_token(&addr_key(&token)).await
    }

    pub async fn get_swap_listener(&self, token: Address) -> Option<SwapListener> {
        self.listeners.read().await.get(&addr_key(&token)).cloned()
    }

    pub async fn active_swap_listeners(&self) -> Vec<SwapListener> {
        self.listeners.read().await.values().cloned().collect()
    }

    /// Drop the token's listener, its pool index entries, and any tracked
    /// transactions that refer to its pools.
    pub async fn remove_pools_for_token(&self, token_key: &str) -> bool {
        let removed = self.listeners.write().await.remove(token_key);
        self.pool_index
            .write()
            .await
            .retain(|_, t| t != token_key);

        let dropped: Vec<(B256, Address, U256)> = {
            let mut table = self.table.lock().await;
            let hashes: Vec<B256> = table
                .iter()
                .filter(|(_, e)| e.swap.token_address == token_key)
                .map(|(h, _)| *h)
                .collect();
            hashes
                .into_iter()
                .filter_map(|h| table.remove(&h).map(|e| (h, e.from, e.nonce)))
                .collect()
        };
        if !dropped.is_empty() {
            let mut by_sender = self.by_sender.lock().await;
            for (hash, from, nonce) in &dropped {
                if by_sender.get(&(*from, *nonce)) == Some(hash) {
                    by_sender.remove(&(*from, *nonce));
                }
            }
            debug!(token = %token_key, dropped = dropped.len(), "dropped tracked transactions");
        }

        removed.is_some()
    }

    // -- Pending pipeline ---------------------------------------------------

    /// Pending-transaction watcher loop. Degrades to log-only mode when the
    /// node does not offer the subscription, retrying after each reconnect.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut epochs = self.chain.reconnect_epochs();
        let capacity = NonZeroUsize::new(self.dedup_size.max(1)).expect("non-zero");
        let mut dedup: LruCache<B256, ()> = LruCache::new(capacity);

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if !self.chain.is_connected() {
                tokio::select! {
                    _ = epochs.changed() => continue,
                    _ = shutdown.cancelled() => return,
                }
            }

            let subscription = match self.chain.subscribe_pending().await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(
                        error = %e,
                        "pending-transaction subscription unavailable, running log-only"
                    );
                    tokio::select! {
                        _ = epochs.changed() => continue,
                        _ = shutdown.cancelled() => return,
                    }
                }
            };
            let mut rx = subscription.rx;

            let mut seen = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        subscription.handle.cancel().await;
                        return;
                    }
                    hash = rx.recv() => {
                        let Some(hash) = hash else {
                            // Stream died with the connection; resubscribe on
                            // the next epoch.
                            break;
                        };
                        seen += 1;
                        if seen % 100_000 == 0 {
                            debug!(seen = seen, "pending-transaction stats");
                        }

                        if dedup.contains(&hash) {
                            continue;
                        }
                        dedup.put(hash, ());

                        if self.listeners.read().await.is_empty() {
                            continue;
                        }

                        let tracker = self.clone();
                        let permit = self
                            .classify_limit
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("classify semaphore closed");
                        tokio::spawn(async move {
                            let _permit = permit;
                            tracker.classify_pending(hash).await;
                        });
                    }
                }
            }
        }
    }

    /// Fetch and classify one pending transaction. All failures are
    /// swallowed; a bad transaction must never affect the subscription.
    async fn classify_pending(self: &Arc<Self>, hash: B256) {
        let tx = match self.chain.transaction_by_hash(hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return,
            Err(e) => {
                trace!(tx = %hash, error = %e, "pending fetch failed");
                return;
            }
        };
        let Some(to) = tx.to else { return };
        let Some(decoded) = decode_pending(&tx.input) else {
            return;
        };

        // Match against the monitored set: pool-direct calls by the `to`
        // address, router calls by either path endpoint.
        let listener = match &decoded.call {
            PendingCall::V2PoolSwap { .. } | PendingCall::V3PoolSwap { .. } => {
                let pool_key = addr_key(&to);
                let token_key = self.pool_index.read().await.get(&pool_key).cloned();
                match token_key {
                    Some(t) => self.listeners.read().await.get(&t).cloned(),
                    None => None,
                }
            }
            PendingCall::V2Router {
                token_in,
                token_out,
            }
            | PendingCall::V3Router {
                token_in,
                token_out,
            } => {
                let listeners = self.listeners.read().await;
                listeners
                    .get(&addr_key(token_in))
                    .or_else(|| listeners.get(&addr_key(token_out)))
                    .cloned()
            }
        };
        let Some(listener) = listener else { return };

        // Mempool-path user filter.
        let user_filter = listener
            .user_address
            .as_deref()
            .and_then(|u| u.parse::<Address>().ok());
        if let Some(user) = user_filter {
            if tx.from != user {
                return;
            }
        }

        let operation = classify_operation(&decoded.call, listener.is_token0);
        let protocol = Protocol::from_tag(&listener.protocol)
            .map(|p| p.kind())
            .unwrap_or(PoolKind::V2);

        let swap = PendingSwap {
            tx_hash: format!("{hash:?}"),
            token_address: listener.token_address.clone(),
            pool_address: listener.pool_address.clone(),
            protocol: listener.protocol.clone(),
            user_address: Some(addr_key(&tx.from)),
            operation,
            method_id: format!("0x{}", hex::encode(decoded.selector)),
            detected_at: chrono::Utc::now().timestamp_millis(),
            status: SwapStatus::Pending,
        };

        // Replacement: a second transaction from the same (from, nonce)
        // supersedes the tracked one.
        let replaced = {
            let mut by_sender = self.by_sender.lock().await;
            match by_sender.get(&(tx.from, tx.nonce)) {
                Some(old_hash) if *old_hash != hash => {
                    let old = *old_hash;
                    by_sender.insert((tx.from, tx.nonce), hash);
                    Some(old)
                }
                Some(_) => return, // same hash redelivered
                None => {
                    by_sender.insert((tx.from, tx.nonce), hash);
                    None
                }
            }
        };

        if let Some(old_hash) = replaced {
            let old_entry = self.table.lock().await.remove(&old_hash);
            if let Some(mut old_entry) = old_entry {
                old_entry.swap.status = SwapStatus::Replaced;
                info!(
                    old = %format!("{old_hash:?}"),
                    new = %swap.tx_hash,
                    "pending swap replaced"
                );
                self.confirm
                    .emit_replaced(&format!("{old_hash:?}"), &swap.tx_hash)
                    .await;

                // Tracking moves to the new hash, which stays pending; no
                // second swap:pending is emitted for it.
                self.table.lock().await.insert(
                    hash,
                    PendingEntry {
                        swap,
                        from: tx.from,
                        nonce: tx.nonce,
                        kind: old_entry.kind,
                        is_token0: old_entry.is_token0,
                        user_filter: old_entry.user_filter,
                    },
                );
                let tracker = self.clone();
                tokio::spawn(async move { tracker.watch_confirmation(hash).await });
                return;
            }
        }

        debug!(
            tx = %swap.tx_hash,
            token = %swap.token_address,
            operation = ?swap.operation,
            "pending swap detected"
        );
        self.confirm.emit_pending(&swap).await;

        self.table.lock().await.insert(
            hash,
            PendingEntry {
                swap,
                from: tx.from,
                nonce: tx.nonce,
                kind: protocol,
                is_token0: listener.is_token0,
                user_filter,
            },
        );

        let tracker = self.clone();
        tokio::spawn(async move { tracker.watch_confirmation(hash).await });
    }

    /// Race the receipt against the pending timeout and settle the entry.
    async fn watch_confirmation(self: Arc<Self>, hash: B256) {
        let result = self
            .chain
            .wait_for_transaction(hash, self.pending_timeout)
            .await;

        // The entry may have been replaced or dropped while waiting; in that
        // case this watcher is abandoned.
        let entry = { self.table.lock().await.remove(&hash) };
        let Some(mut entry) = entry else { return };
        {
            let mut by_sender = self.by_sender.lock().await;
            if by_sender.get(&(entry.from, entry.nonce)) == Some(&hash) {
                by_sender.remove(&(entry.from, entry.nonce));
            }
        }

        match result {
            Ok(Some(receipt)) if receipt.succeeded() => {
                entry.swap.status = SwapStatus::Confirmed;
                let operation = self.resolve_confirmed_operation(&entry, &receipt);

                if !self.confirmed_user_filter_passes(&entry, &receipt) {
                    debug!(tx = %entry.swap.tx_hash, "confirmed swap filtered by user address");
                    return;
                }

                self.confirm
                    .emit_confirmed(&ConfirmedEnvelope {
                        event: "swap:confirmed".to_string(),
                        tx_hash: entry.swap.tx_hash.clone(),
                        block_number: receipt
                            .block_number
                            .map(|b| b.saturating_to::<u64>())
                            .unwrap_or(0),
                        gas_used: receipt
                            .gas_used
                            .map(|g| g.saturating_to::<u64>())
                            .unwrap_or(0),
                        token_address: entry.swap.token_address.clone(),
                        pool_address: entry.swap.pool_address.clone(),
                        user_address: entry.swap.user_address.clone(),
                        operation,
                        status: SwapStatus::Confirmed,
                        protocol: entry.swap.protocol.clone(),
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    })
                    .await;
            }
            Ok(Some(receipt)) => {
                entry.swap.status = SwapStatus::Failed;
                self.confirm
                    .emit_failed(&FailedEnvelope {
                        event: "swap:failed".to_string(),
                        tx_hash: entry.swap.tx_hash.clone(),
                        block_number: receipt.block_number.map(|b| b.saturating_to::<u64>()),
                        reason: "execution reverted".to_string(),
                        status: SwapStatus::Failed,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    })
                    .await;
            }
            Ok(None) => {
                entry.swap.status = SwapStatus::TimedOut;
                debug!(tx = %entry.swap.tx_hash, "pending swap timed out");
            }
            Err(e) => {
                self.metrics.record_error("confirm-watch", e.to_string());
            }
        }
    }

    /// Resolve a still-unknown direction from the confirmed receipt's swap
    /// log, when one from the monitored pool is present.
    fn resolve_confirmed_operation(
        &self,
        entry: &PendingEntry,
        receipt: &TransactionReceipt,
    ) -> SwapOperation {
        if entry.swap.operation != SwapOperation::Unknown {
            return entry.swap.operation;
        }
        let Some(log) = self.find_pool_swap_log(entry, receipt) else {
            return SwapOperation::Unknown;
        };
        match crate::pool::decode_swap_log(entry.kind, &log) {
            Ok(swap_log) => {
                let pool = throwaway_pool(entry.kind, entry.is_token0);
                if crate::classifier::classify(&pool, &swap_log).is_buy {
                    SwapOperation::Buy
                } else {
                    SwapOperation::Sell
                }
            }
            Err(_) => SwapOperation::Unknown,
        }
    }

    /// Confirmed-log user filter: pass when no filter is set, the sender
    /// matches, or the swap log's participants match.
    fn confirmed_user_filter_passes(
        &self,
        entry: &PendingEntry,
        receipt: &TransactionReceipt,
    ) -> bool {
        let Some(user) = entry.user_filter else {
            return true;
        };
        if entry.from == user {
            return true;
        }
        let Some(log) = self.find_pool_swap_log(entry, receipt) else {
            return false;
        };
        if log.topics.len() < 3 {
            return false;
        }
        abi::topic_address(&log.topics[1]) == user || abi::topic_address(&log.topics[2]) == user
    }

    fn find_pool_swap_log(
        &self,
        entry: &PendingEntry,
        receipt: &TransactionReceipt,
    ) -> Option<LogEvent> {
        receipt
            .logs
            .iter()
            .find(|l| {
                addr_key(&l.address) == entry.swap.pool_address
                    && l.topics
                        .first()
                        .map(|t| *t == entry.kind.swap_topic())
                        .unwrap_or(false)
            })
            .map(|l| LogEvent {
                address: l.address,
                topics: l.topics.clone(),
                data: l.data.to_vec(),
                tx_hash: receipt.transaction_hash,
                block_number: receipt.block_number.map(|b| b.saturating_to::<u64>()),
            })
    }

    async fn read_pool_token(&self, pool: Address, selector: [u8; 4]) -> Result<Address> {
        let data = self
            .chain
            .call(pool, abi::selector_call(selector))
            .await
            .map_err(|e| FeedError::PoolLoadFailed {
                pool: addr_key(&pool),
                reason: e.to_string(),
            })?;
        abi::word_address(&data, 0).ok_or_else(|| FeedError::PoolLoadFailed {
            pool: addr_key(&pool),
            reason: "short token return data".into(),
        })
    }
}

/// Direction from a decoded pool-direct call; router and V3-direct calls
/// stay unknown until the log settles it.
fn classify_operation(call: &PendingCall, is_token0: bool) -> SwapOperation {
    match call {
        PendingCall::V2PoolSwap {
            amount0_out,
            amount1_out,
            ..
        } => {
            let token_out = if is_token0 { amount0_out } else { amount1_out };
            if *token_out > U256::ZERO {
                SwapOperation::Buy
            } else {
                SwapOperation::Sell
            }
        }
        _ => SwapOperation::Unknown,
    }
}

/// Minimal pool value for direction classification from a receipt log.
fn throwaway_pool(kind: PoolKind, is_token0: bool) -> Pool {
    Pool {
        address: Address::ZERO,
        kind,
        token0: Address::ZERO,
        token1: Address::ZERO,
        decimals0: constants::DEFAULT_DECIMALS,
        decimals1: constants::DEFAULT_DECIMALS,
        fee: 0,
        tick_spacing: 0,
        is_token0,
        reserve0: U256::ZERO,
        reserve1: U256::ZERO,
        sqrt_price_x96: U256::ZERO,
        liquidity: U256::ZERO,
        pair: Pair::Wbnb,
        priority: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_operation_v2_pool_direct() {
        let buy = PendingCall::V2PoolSwap {
            amount0_out: U256::from(100u64),
            amount1_out: U256::ZERO,
            to: Address::ZERO,
        };
        assert_eq!(classify_operation(&buy, true), SwapOperation::Buy);
        assert_eq!(classify_operation(&buy, false), SwapOperation::Sell);

        let sell = PendingCall::V2PoolSwap {
            amount0_out: U256::ZERO,
            amount1_out: U256::from(100u64),
            to: Address::ZERO,
        };
        assert_eq!(classify_operation(&sell, true), SwapOperation::Sell);
        assert_eq!(classify_operation(&sell, false), SwapOperation::Buy);
    }

    #[test]
    fn test_router_calls_stay_unknown() {
        let call = PendingCall::V2Router {
            token_in: Address::repeat_byte(0x01),
            token_out: Address::repeat_byte(0x02),
        };
        assert_eq!(classify_operation(&call, true), SwapOperation::Unknown);

        let v3 = PendingCall::V3PoolSwap {
            recipient: Address::ZERO,
            zero_for_one: true,
            amount_specified: alloy::primitives::I256::ONE,
        };
        assert_eq!(classify_operation(&v3, true), SwapOperation::Unknown);
    }
}
