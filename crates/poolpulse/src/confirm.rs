//! Outbound confirmation emitter.
//!
//! A small WebSocket client that pushes swap-lifecycle envelopes to the
//! downstream confirmation consumer. Delivery is best-effort: while the
//! consumer is unreachable, envelopes are dropped and counted. The connection
//! retries forever with a fixed delay; losing the consumer must never affect
//! the feed itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{PendingSwap, SwapOperation, SwapStatus};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const QUEUE_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEnvelope {
    pub event: String,
    pub tx_hash: String,
    pub token_address: String,
    pub pool_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
    pub operation: SwapOperation,
    pub status: SwapStatus,
    pub protocol: String,
    pub timestamp: String,
    /// Detection wall-clock in milliseconds.
    pub detection_time: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedEnvelope {
    pub event: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub token_address: String,
    pub pool_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
    pub operation: SwapOperation,
    pub status: SwapStatus,
    pub protocol: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEnvelope {
    pub event: String,
    pub tx_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    pub reason: String,
    pub status: SwapStatus,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacedEnvelope {
    pub event: String,
    pub old_tx_hash: String,
    pub new_tx_hash: String,
    pub status: SwapStatus,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

pub struct ConfirmEmitter {
    url: Option<String>,
    frame_tx: mpsc::Sender<String>,
    frame_rx: Mutex<Option<mpsc::Receiver<String>>>,
    connected: AtomicBool,
    dropped: AtomicU64,
}

impl ConfirmEmitter {
    /// `url = None` disables the emitter; every emit becomes a counted drop.
    pub fn new(url: Option<String>) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            url,
            frame_tx,
            frame_rx: Mutex::new(Some(frame_rx)),
            connected: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn emit_pending(&self, swap: &PendingSwap) {
        let envelope = PendingEnvelope {
            event: "swap:pending".to_string(),
            tx_hash: swap.tx_hash.clone(),
            token_address: swap.token_address.clone(),
            pool_address: swap.pool_address.clone(),
            user_address: swap.user_address.clone(),
            operation: swap.operation,
            status: SwapStatus::Pending,
            protocol: swap.protocol.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            detection_time: swap.detected_at,
        };
        self.emit(&envelope);
    }

    pub async fn emit_confirmed(&self, envelope: &ConfirmedEnvelope) {
        self.emit(envelope);
    }

    pub async fn emit_failed(&self, envelope: &FailedEnvelope) {
        self.emit(envelope);
    }

    pub async fn emit_replaced(&self, old_tx_hash: &str, new_tx_hash: &str) {
        let envelope = ReplacedEnvelope {
            event: "swap:replaced".to_string(),
            old_tx_hash: old_tx_hash.to_string(),
            new_tx_hash: new_tx_hash.to_string(),
            status: SwapStatus::Replaced,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.emit(&envelope);
    }

    /// Queue one envelope; drop with a warning count when the consumer is
    /// not reachable or the queue is full.
    fn emit(&self, envelope: &impl Serialize) {
        if !self.connected.load(Ordering::SeqCst) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!(dropped = dropped, "confirmation consumer unreachable, dropping envelope");
            }
            return;
        }
        let frame = match serde_json::to_string(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to serialize confirmation envelope");
                return;
            }
        };
        if self.frame_tx.try_send(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Connection driver. Returns immediately when no URL is configured.
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(url) = self.url.clone() else {
            info!("no confirmation consumer configured");
            return;
        };
        let mut frame_rx = match self.frame_rx.lock().expect("frame_rx lock poisoned").take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match connect_async(&url).await {
                Ok((ws, _)) => {
                    info!(url = %url, "confirmation consumer connected");
                    self.connected.store(true, Ordering::SeqCst);
                    let (mut write, mut read) = ws.split();

                    loop {
                        tokio::select! {
                            frame = frame_rx.recv() => {
                                match frame {
                                    Some(frame) => {
                                        if let Err(e) = write.send(Message::Text(frame.into())).await {
                                            warn!(error = %e, "confirmation send failed");
                                            break;
                                        }
                                    }
                                    None => return,
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Ping(data))) => {
                                        let _ = write.send(Message::Pong(data)).await;
                                    }
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Err(e)) => {
                                        debug!(error = %e, "confirmation socket error");
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            _ = shutdown.cancelled() => {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }

                    self.connected.store(false, Ordering::SeqCst);
                    warn!("confirmation consumer disconnected");
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "confirmation connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_emits_are_counted_drops() {
        let emitter = ConfirmEmitter::new(Some("ws://127.0.0.1:1".to_string()));
        let swap = PendingSwap {
            tx_hash: "0xabc".into(),
            token_address: "0x1".into(),
            pool_address: "0x2".into(),
            protocol: "uniswapv2".into(),
            user_address: None,
            operation: SwapOperation::Buy,
            method_id: "0x022c0d9f".into(),
            detected_at: 0,
            status: SwapStatus::Pending,
        };
        emitter.emit_pending(&swap).await;
        emitter.emit_pending(&swap).await;
        assert_eq!(emitter.dropped_count(), 2);
    }

    #[test]
    fn test_envelope_serialization() {
        let env = ReplacedEnvelope {
            event: "swap:replaced".into(),
            old_tx_hash: "0xold".into(),
            new_tx_hash: "0xnew".into(),
            status: SwapStatus::Replaced,
            timestamp: "t".into(),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["event"], "swap:replaced");
        assert_eq!(v["oldTxHash"], "0xold");
        assert_eq!(v["newTxHash"], "0xnew");
        assert_eq!(v["status"], "replaced");
    }
}
