//! Node WebSocket client.
//!
//! A single multiplexed JSON-RPC connection: typed calls resolve through a
//! pending-request table, `eth_subscribe` streams are routed to per-
//! subscription channels, and the connection loop reconnects with bounded
//! attempts. After each reconnect a monotonically increasing epoch is
//! published so owners of dead subscriptions can re-establish them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::addr_key;
use crate::errors::{FeedError, Result};
use crate::types::LogEvent;

/// Capacity of each subscription's delivery channel.
const SUB_CHANNEL_CAPACITY: usize = 1024;

/// Receipt poll spacing inside `wait_for_transaction`.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A transaction object as returned by `eth_getTransactionByHash`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub nonce: U256,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub block_number: Option<U256>,
}

/// A receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub status: Option<U256>,
    #[serde(default)]
    pub block_number: Option<U256>,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

/// A log entry inside a receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s == U256::from(1u64)).unwrap_or(false)
    }
}

/// The raw log object delivered on a `logs` subscription.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    transaction_hash: B256,
    #[serde(default)]
    block_number: Option<U256>,
    #[serde(default)]
    removed: bool,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

enum SubSink {
    Logs(mpsc::Sender<LogEvent>),
    Pending(mpsc::Sender<B256>),
}

/// Handle to a live chain subscription. `cancel` detaches the local route and
/// sends `eth_unsubscribe`; it is idempotent, and dropping the handle performs
/// the same release best-effort.
pub struct SubscriptionHandle {
    sub_id: String,
    inner: Arc<Inner>,
    cancelled: AtomicBool,
}

impl SubscriptionHandle {
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.remove_sub(&self.sub_id);
        let _ = self
            .inner
            .request("eth_unsubscribe", json!([self.sub_id]))
            .await;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.remove_sub(&self.sub_id);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_unsubscribe",
            "params": [self.sub_id],
        })
        .to_string();
        let _ = self.inner.write_tx.try_send(frame);
    }
}

/// A log subscription: the handle plus its delivery channel.
pub struct LogSubscription {
    pub handle: SubscriptionHandle,
    pub rx: mpsc::Receiver<LogEvent>,
}

/// A pending-transaction subscription.
pub struct PendingSubscription {
    pub handle: SubscriptionHandle,
    pub rx: mpsc::Receiver<B256>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Inner {
    url: String,
    write_tx: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    subs: Mutex<HashMap<String, SubSink>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    epoch_tx: watch::Sender<u64>,
    rpc_timeout: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    shutdown: CancellationToken,
}

/// Cloneable handle to the node connection.
#[derive(Clone)]
pub struct ChainClient {
    inner: Arc<Inner>,
    write_rx: Arc<Mutex<Option<mpsc::Receiver<String>>>>,
}

impl ChainClient {
    pub fn new(
        url: &str,
        rpc_timeout: Duration,
        reconnect_delay: Duration,
        max_reconnect_attempts: u32,
        shutdown: CancellationToken,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(256);
        let (epoch_tx, _) = watch::channel(0u64);
        let write_rx = Arc::new(Mutex::new(Some(write_rx)));
        Self {
            write_rx,
            inner: Arc::new(Inner {
                url: url.to_string(),
                write_tx,
                pending: Mutex::new(HashMap::new()),
                subs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                epoch_tx,
                rpc_timeout,
                reconnect_delay,
                max_reconnect_attempts,
                shutdown,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Epochs increment after every (re)connect. Receivers use this to learn
    /// that their subscriptions died and must be re-established.
    pub fn reconnect_epochs(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    /// Wait until the connection is established (epoch leaves zero).
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.epoch_tx.subscribe();
        while *rx.borrow() == 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Connection driver. Spawn exactly once; runs until shutdown or
    /// reconnect exhaustion (which cancels the shutdown token itself).
    pub async fn run(&self) {
        let mut write_rx = {
            let mut slot = self.write_rx.lock().expect("write_rx lock poisoned");
            match slot.take() {
                Some(rx) => rx,
                None => {
                    error!("chain client run() invoked twice");
                    return;
                }
            }
        };

        let inner = &self.inner;
        let mut attempt = 0u32;

        loop {
            if inner.shutdown.is_cancelled() {
                info!("chain client shutdown requested");
                return;
            }

            info!(url = %inner.url, attempt = attempt + 1, "connecting to node WebSocket");

            match self.connect_and_drive(&mut write_rx).await {
                Ok(()) => {
                    info!("chain client stopped cleanly");
                    return;
                }
                Err(e) => {
                    inner.connected.store(false, Ordering::SeqCst);
                    inner.fail_pending("node connection lost");
                    inner.clear_subs();

                    attempt += 1;
                    if attempt >= inner.max_reconnect_attempts {
                        error!(
                            error = %e,
                            attempts = attempt,
                            "max reconnect attempts reached, shutting down"
                        );
                        inner.shutdown.cancel();
                        return;
                    }

                    let delay = inner.reconnect_delay * attempt.min(6);
                    warn!(
                        error = %e,
                        attempt = attempt,
                        delay_secs = delay.as_secs(),
                        "node WebSocket disconnected, reconnecting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = inner.shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    /// One connection lifetime: connect, mark live, pump frames until error
    /// or shutdown.
    async fn connect_and_drive(
        &self,
        write_rx: &mut mpsc::Receiver<String>,
    ) -> std::result::Result<(), anyhow::Error> {
        let inner = &self.inner;
        let (ws_stream, _response) = connect_async(&inner.url).await?;
        let (mut write, mut read) = ws_stream.split();

        inner.connected.store(true, Ordering::SeqCst);
        inner.epoch_tx.send_modify(|e| *e += 1);
        info!(epoch = *inner.epoch_tx.borrow(), "node WebSocket connected");

        let mut received = 0u64;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            received += 1;
                            inner.dispatch(&text);
                            if received % 50_000 == 0 {
                                debug!(received = received, "node WebSocket frame stats");
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(anyhow::anyhow!("node closed the WebSocket"));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(anyhow::anyhow!("node WebSocket stream ended")),
                        _ => {}
                    }
                }
                frame = write_rx.recv() => {
                    match frame {
                        Some(text) => write.send(Message::Text(text.into())).await?,
                        None => return Err(anyhow::anyhow!("write channel closed")),
                    }
                }
                _ = inner.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    // -- Typed RPC ----------------------------------------------------------

    pub async fn chain_id(&self) -> Result<u64> {
        let v = self.inner.request("eth_chainId", json!([])).await?;
        parse_quantity(&v)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let v = self.inner.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&v)
    }

    /// `eth_call` against latest with raw calldata, returning raw bytes.
    pub async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let params = json!([
            { "to": addr_key(&to), "data": format!("0x{}", hex::encode(data)) },
            "latest",
        ]);
        let v = self.inner.request("eth_call", params).await?;
        let s = v
            .as_str()
            .ok_or_else(|| FeedError::BadReturnData {
                call: "eth_call".into(),
                reason: "non-string result".into(),
            })?;
        hex::decode(s.trim_start_matches("0x")).map_err(|e| FeedError::BadReturnData {
            call: "eth_call".into(),
            reason: e.to_string(),
        })
    }

    pub async fn transaction_by_hash(&self, hash: B256) -> Result<Option<Transaction>> {
        let v = self
            .inner
            .request("eth_getTransactionByHash", json!([format!("{hash:?}")]))
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(v)?))
    }

    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>> {
        let v = self
            .inner
            .request("eth_getTransactionReceipt", json!([format!("{hash:?}")]))
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(v)?))
    }

    /// Poll for a receipt until `timeout` elapses. `Ok(None)` means the
    /// timeout won the race.
    pub async fn wait_for_transaction(
        &self,
        hash: B256,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => {}
                // Transient failures during a reconnect window are retried
                // until the deadline.
                Err(e) => trace!(error = %e, tx = %hash, "receipt poll failed"),
            }

            if tokio::time::Instant::now() + RECEIPT_POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(RECEIPT_POLL_INTERVAL) => {}
                _ = self.inner.shutdown.cancelled() => return Ok(None),
            }
        }
    }

    // -- Subscriptions ------------------------------------------------------

    /// Subscribe to logs for one `(address, topic)` pair.
    pub async fn subscribe_logs(&self, address: Address, topic: B256) -> Result<LogSubscription> {
        let params = json!([
            "logs",
            { "address": addr_key(&address), "topics": [format!("{topic:?}")] },
        ]);
        let v = self.inner.request("eth_subscribe", params).await?;
        let sub_id = v
            .as_str()
            .ok_or_else(|| FeedError::Transport("non-string subscription id".into()))?
            .to_string();

        let (tx, rx) = mpsc::channel(SUB_CHANNEL_CAPACITY);
        self.inner
            .subs
            .lock()
            .expect("subs lock poisoned")
            .insert(sub_id.clone(), SubSink::Logs(tx));

        debug!(address = %addr_key(&address), sub = %sub_id, "log subscription established");
        Ok(LogSubscription {
            handle: SubscriptionHandle {
                sub_id,
                inner: self.inner.clone(),
                cancelled: AtomicBool::new(false),
            },
            rx,
        })
    }

    /// Subscribe to pending transaction hashes. Some providers do not
    /// support this; callers degrade to log-only mode on error.
    pub async fn subscribe_pending(&self) -> Result<PendingSubscription> {
        let v = self
            .inner
            .request("eth_subscribe", json!(["newPendingTransactions"]))
            .await?;
        let sub_id = v
            .as_str()
            .ok_or_else(|| FeedError::Transport("non-string subscription id".into()))?
            .to_string();

        let (tx, rx) = mpsc::channel(SUB_CHANNEL_CAPACITY);
        self.inner
            .subs
            .lock()
            .expect("subs lock poisoned")
            .insert(sub_id.clone(), SubSink::Pending(tx));

        info!(sub = %sub_id, "pending-transaction subscription established");
        Ok(PendingSubscription {
            handle: SubscriptionHandle {
                sub_id,
                inner: self.inner.clone(),
                cancelled: AtomicBool::new(false),
            },
            rx,
        })
    }
}

impl Inner {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FeedError::Transport("not connected".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        if self.write_tx.send(frame).await.is_err() {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(FeedError::Transport("write channel closed".into()));
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FeedError::Transport("connection lost mid-request".into())),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&id);
                Err(FeedError::RpcTimeout {
                    method: method.to_string(),
                    timeout_seconds: self.rpc_timeout.as_secs(),
                })
            }
        }
    }

    /// Route one inbound frame: either a response to a parked request or a
    /// subscription notification.
    fn dispatch(&self, text: &str) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "unparseable node frame");
                return;
            }
        };

        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let sender = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            let Some(sender) = sender else {
                trace!(id = id, "response for unknown request id");
                return;
            };
            let outcome = if let Some(err) = msg.get("error") {
                Err(FeedError::Rpc {
                    code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                })
            } else {
                Ok(msg.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = sender.send(outcome);
            return;
        }

        if msg.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            let Some(params) = msg.get("params") else { return };
            let Some(sub_id) = params.get("subscription").and_then(Value::as_str) else {
                return;
            };
            let Some(result) = params.get("result") else { return };

            let subs = self.subs.lock().expect("subs lock poisoned");
            match subs.get(sub_id) {
                Some(SubSink::Logs(tx)) => {
                    if let Some(event) = decode_log_notification(result) {
                        if let Err(e) = tx.try_send(event) {
                            warn!(sub = sub_id, error = %e, "log channel backed up, dropping event");
                        }
                    }
                }
                Some(SubSink::Pending(tx)) => {
                    // Providers occasionally deliver non-hash garbage on this
                    // channel (block headers, objects); anything that is not
                    // a 0x-prefixed 66-char string is silently dropped.
                    let Some(s) = result.as_str() else { return };
                    if s.len() != 66 || !s.starts_with("0x") {
                        return;
                    }
                    if let Ok(hash) = s.parse::<B256>() {
                        let _ = tx.try_send(hash);
                    }
                }
                None => trace!(sub = sub_id, "notification for unknown subscription"),
            }
        }
    }

    fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(FeedError::Transport(reason.into())));
        }
    }

    fn clear_subs(&self) {
        self.subs.lock().expect("subs lock poisoned").clear();
    }

    fn remove_sub(&self, sub_id: &str) {
        self.subs.lock().expect("subs lock poisoned").remove(sub_id);
    }
}

fn decode_log_notification(result: &Value) -> Option<LogEvent> {
    let raw: RawLog = serde_json::from_value(result.clone()).ok()?;
    if raw.removed {
        return None;
    }
    Some(LogEvent {
        address: raw.address,
        topics: raw.topics,
        data: raw.data.to_vec(),
        tx_hash: raw.transaction_hash,
        block_number: raw.block_number.map(|b| b.saturating_to::<u64>()),
    })
}

/// Parse a JSON-RPC hex quantity (`"0x1a"`).
fn parse_quantity(v: &Value) -> Result<u64> {
    let s = v.as_str().ok_or_else(|| FeedError::BadReturnData {
        call: "quantity".into(),
        reason: "non-string result".into(),
    })?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| FeedError::BadReturnData {
        call: "quantity".into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x38")).unwrap(), 56);
        assert!(parse_quantity(&json!(56)).is_err());
    }

    #[test]
    fn test_decode_log_notification() {
        let raw = json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [
                "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822"
            ],
            "data": "0x00000000000000000000000000000000000000000000000000000000000000ff",
            "transactionHash":
                "0x2222222222222222222222222222222222222222222222222222222222222222",
            "blockNumber": "0x10"
        });
        let event = decode_log_notification(&raw).unwrap();
        assert_eq!(event.block_number, Some(16));
        assert_eq!(event.data.len(), 32);
        assert_eq!(event.topics.len(), 1);
    }

    #[test]
    fn test_removed_logs_are_dropped() {
        let raw = json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [],
            "data": "0x",
            "transactionHash":
                "0x2222222222222222222222222222222222222222222222222222222222222222",
            "removed": true
        });
        assert!(decode_log_notification(&raw).is_none());
    }

    #[test]
    fn test_receipt_status() {
        let ok: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash":
                "0x2222222222222222222222222222222222222222222222222222222222222222",
            "status": "0x1",
            "blockNumber": "0x100",
            "gasUsed": "0x5208"
        }))
        .unwrap();
        assert!(ok.succeeded());

        let failed: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash":
                "0x2222222222222222222222222222222222222222222222222222222222222222",
            "status": "0x0"
        }))
        .unwrap();
        assert!(!failed.succeeded());
    }

    #[tokio::test]
    async fn test_request_fails_when_disconnected() {
        let client = ChainClient::new(
            "ws://127.0.0.1:1",
            Duration::from_secs(1),
            Duration::from_secs(1),
            1,
            CancellationToken::new(),
        );
        let err = client.block_number().await.unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));
    }
}
