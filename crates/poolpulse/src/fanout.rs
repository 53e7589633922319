//! Client fan-out: the pub/sub WebSocket surface.
//!
//! Sessions subscribe to per-token rooms (`token:<lower-address>`); price
//! updates and swap events broadcast room-only, heartbeats globally. A
//! reaper sweeps sessions that stop pinging. Subscription changes feed the
//! listener registry through a command channel so the hub itself never calls
//! back into it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::format_amount;
use crate::constants::normalize_addr;
use crate::metrics::Metrics;
use crate::price::PriceEngine;
use crate::types::{parse_address, TokenPrice};

/// Commands the hub hands to the coordinator for registry side effects.
#[derive(Debug)]
pub enum RegistryCommand {
    /// First-subscription trigger for `addToken`.
    Subscribe(Address),
    /// A token room lost its last member.
    RoomEmpty(Address),
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Client → server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    Subscribe {
        #[serde(rename = "tokenAddress")]
        token_address: String,
    },
    Unsubscribe {
        #[serde(rename = "tokenAddress")]
        token_address: String,
    },
    Ping,
    GetAllPrices,
}

/// The swap-event payload broadcast on a token room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEventMsg {
    pub token_address: String,
    pub symbol: String,
    pub pool_address: String,
    pub tx_hash: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    #[serde(rename = "amountBNB")]
    pub amount_bnb: f64,
    pub amount_token: f64,
    pub pair_symbol: String,
    pub pair_amount: f64,
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "valueUSD")]
    pub value_usd: f64,
    pub timestamp: String,
}

#[derive(Serialize)]
struct Formatted {
    #[serde(rename = "priceUSD")]
    price_usd: String,
    #[serde(rename = "priceBNB")]
    price_bnb: String,
}

/// Server → client frames are `{"type": <name>, "data": <payload>}`.
fn envelope(kind: &str, data: impl Serialize) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

fn room_name(token_key: &str) -> String {
    format!("token:{token_key}")
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

struct Session {
    socket_id: String,
    connected_at: String,
    last_ping: Instant,
    subscriptions: HashSet<String>,
    remote_addr: String,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

pub struct FanoutHub {
    engine: Arc<PriceEngine>,
    metrics: Arc<Metrics>,
    commands: mpsc::Sender<RegistryCommand>,
    sessions: RwLock<HashMap<u64, Session>>,
    rooms: RwLock<HashMap<String, HashSet<u64>>>,
    next_id: AtomicU64,
    stale_after: Duration,
    production: bool,
}

impl FanoutHub {
    pub fn new(
        engine: Arc<PriceEngine>,
        metrics: Arc<Metrics>,
        commands: mpsc::Sender<RegistryCommand>,
        stale_after: Duration,
        production: bool,
    ) -> Self {
        Self {
            engine,
            metrics,
            commands,
            sessions: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stale_after,
            production,
        }
    }

    // -- Broadcast surface --------------------------------------------------

    pub async fn broadcast_price_update(&self, price: &TokenPrice) {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct PriceUpdateMsg<'a> {
            #[serde(flatten)]
            price: &'a TokenPrice,
            formatted: Formatted,
        }

        let frame = envelope(
            "price-update",
            PriceUpdateMsg {
                price,
                formatted: Formatted {
                    price_usd: format!("${}", format_amount(price.price_usd)),
                    price_bnb: format!("{} BNB", format_amount(price.price_bnb)),
                },
            },
        );
        self.broadcast_room(&room_name(&price.token_address), frame)
            .await;
    }

    pub async fn broadcast_swap_event(&self, token_key: &str, msg: &SwapEventMsg) {
        let frame = envelope("swap-event", msg);
        self.broadcast_room(&room_name(token_key), frame).await;
    }

    pub async fn broadcast_swap_update(&self, token_key: &str, tx_hash: &str, sender: &str) {
        let frame = envelope("swap-update", json!({ "txHash": tx_hash, "sender": sender }));
        self.broadcast_room(&room_name(token_key), frame).await;
    }

    /// Global heartbeat with service stats.
    pub async fn broadcast_heartbeat(&self, monitored_tokens: usize) {
        let stats = self.metrics.get_stats();
        let frame = envelope(
            "heartbeat",
            json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "monitoredTokens": monitored_tokens,
                "uptime": stats.uptime_seconds,
                "metrics": {
                    "priceUpdates": stats.price_updates,
                    "cacheHits": stats.cache_hits,
                    "eventsReceived": stats.events_received,
                },
            }),
        );
        self.broadcast_global(frame).await;
    }

    pub async fn broadcast_global(&self, frame: String) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = session.tx.send(frame.clone());
        }
    }

    async fn broadcast_room(&self, room: &str, frame: String) {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return;
        };
        let sessions = self.sessions.read().await;
        for id in members {
            if let Some(session) = sessions.get(id) {
                let _ = session.tx.send(frame.clone());
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // -- Accept loop --------------------------------------------------------

    pub async fn run_listener(
        self: Arc<Self>,
        listen_addr: &str,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(addr = listen_addr, "fan-out listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let hub = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                hub.handle_connection(stream, peer.to_string(), shutdown).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("fan-out listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: String,
        shutdown: CancellationToken,
    ) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %remote_addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let socket_id = format!("sess-{id}");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        self.metrics.inc_ws_connections();
        self.sessions.write().await.insert(
            id,
            Session {
                socket_id: socket_id.clone(),
                connected_at: chrono::Utc::now().to_rfc3339(),
                last_ping: Instant::now(),
                subscriptions: HashSet::new(),
                remote_addr: remote_addr.clone(),
                tx: tx.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(socket = %socket_id, peer = %remote_addr, "client connected");

        let _ = tx.send(envelope(
            "welcome",
            json!({
                "message": "connected to poolpulse price feed",
                "socketId": socket_id,
                "service": "poolpulse",
                "features": {
                    "v2Support": true,
                    "v3Support": true,
                    "pancakeswapSupport": true,
                    "multiPoolSupport": true,
                    "dynamicBnbPrice": true,
                    "caching": true,
                    "metricsTracking": true,
                    "buySellDetection": true,
                },
            }),
        ));

        // Writer: drains the session queue into the socket.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        match frame {
                            Some(frame) => {
                                if write.send(Message::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = writer_cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: client messages until disconnect, reap, or shutdown.
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_client_message(id, &text).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            self.touch_ping(id).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(socket = %socket_id, error = %e, "client socket error");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
            }
        }

        cancel.cancel();
        let _ = writer.await;
        self.cleanup_session(id).await;
        info!(socket = %socket_id, "client disconnected");
    }

    async fn handle_client_message(&self, id: u64, text: &str) {
        let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
        let msg = match parsed {
            Ok(msg) => msg,
            Err(e) => {
                let detail = if self.production {
                    "malformed message".to_string()
                } else {
                    format!("malformed message: {e}")
                };
                self.send_to(id, envelope("error", json!({ "message": detail })))
                    .await;
                return;
            }
        };

        match msg {
            ClientMessage::Subscribe { token_address } => {
                let normalized = normalize_addr(&token_address);
                let Ok(address) = parse_address(&normalized) else {
                    self.send_to(
                        id,
                        envelope("error", json!({ "message": "invalid token address" })),
                    )
                    .await;
                    return;
                };

                let room = room_name(&normalized);
                {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.get_mut(&id) {
                        session.subscriptions.insert(normalized.clone());
                    }
                }
                self.rooms
                    .write()
                    .await
                    .entry(room.clone())
                    .or_default()
                    .insert(id);

                let _ = self.commands.send(RegistryCommand::Subscribe(address)).await;

                let current = self.engine.cached(&normalized);
                self.send_to(
                    id,
                    envelope(
                        "subscribed",
                        json!({
                            "tokenAddress": normalized,
                            "currentPrice": current,
                            "room": room,
                        }),
                    ),
                )
                .await;
            }
            ClientMessage::Unsubscribe { token_address } => {
                let normalized = normalize_addr(&token_address);
                self.leave_room(id, &normalized).await;
                self.send_to(
                    id,
                    envelope("unsubscribed", json!({ "tokenAddress": normalized })),
                )
                .await;
            }
            ClientMessage::Ping => {
                self.touch_ping(id).await;
                self.send_to(
                    id,
                    envelope("pong", json!({ "time": chrono::Utc::now().to_rfc3339() })),
                )
                .await;
            }
            ClientMessage::GetAllPrices => {
                self.metrics.inc_api_requests();
                self.send_to(
                    id,
                    envelope("all-prices", json!({ "prices": self.engine.all_cached() })),
                )
                .await;
            }
        }
    }

    async fn send_to(&self, id: u64, frame: String) {
        if let Some(session) = self.sessions.read().await.get(&id) {
            let _ = session.tx.send(frame);
        }
    }

    async fn touch_ping(&self, id: u64) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.last_ping = Instant::now();
        }
    }

    /// Remove a session from one room, firing `RoomEmpty` when it was the
    /// last member.
    async fn leave_room(&self, id: u64, token_key: &str) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&id) {
                session.subscriptions.remove(token_key);
            }
        }

        let room = room_name(token_key);
        let now_empty = {
            let mut rooms = self.rooms.write().await;
            match rooms.get_mut(&room) {
                Some(members) => {
                    members.remove(&id);
                    if members.is_empty() {
                        rooms.remove(&room);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if now_empty {
            if let Ok(address) = parse_address(token_key) {
                let _ = self.commands.send(RegistryCommand::RoomEmpty(address)).await;
            }
        }
    }

    async fn cleanup_session(&self, id: u64) {
        let subscriptions = match self.sessions.write().await.remove(&id) {
            Some(session) => session.subscriptions,
            None => return,
        };
        for token_key in subscriptions {
            self.leave_room(id, &token_key).await;
        }
    }

    // -- Stale reaper -------------------------------------------------------

    /// Sweep sessions whose last ping is older than the stale threshold.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }

            let stale: Vec<(u64, String, String, String)> = {
                let sessions = self.sessions.read().await;
                sessions
                    .iter()
                    .filter(|(_, s)| s.last_ping.elapsed() > self.stale_after)
                    .map(|(id, s)| {
                        (
                            *id,
                            s.socket_id.clone(),
                            s.remote_addr.clone(),
                            s.connected_at.clone(),
                        )
                    })
                    .collect()
            };

            for (id, socket_id, peer, connected_at) in stale {
                warn!(
                    socket = %socket_id,
                    peer = %peer,
                    connected_at = %connected_at,
                    "reaping stale session"
                );
                if let Some(session) = self.sessions.read().await.get(&id) {
                    session.cancel.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","tokenAddress":"0xBB4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get-all-prices"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetAllPrices));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_room_name() {
        assert_eq!(
            room_name("0xabc0000000000000000000000000000000000000"),
            "token:0xabc0000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_envelope_shape() {
        let frame = envelope("pong", json!({ "time": "t" }));
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "pong");
        assert_eq!(v["data"]["time"], "t");
    }

    #[test]
    fn test_swap_event_serializes_expected_fields() {
        let msg = SwapEventMsg {
            token_address: "0xaa".into(),
            symbol: "MON".into(),
            pool_address: "0xbb".into(),
            tx_hash: "0xcc".into(),
            kind: "buy".into(),
            sender: String::new(),
            amount_bnb: 0.1,
            amount_token: 10.0,
            pair_symbol: "WBNB".into(),
            pair_amount: 0.1,
            price_usd: 6.0,
            value_usd: 60.0,
            timestamp: "t".into(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "buy");
        assert_eq!(v["amountBNB"], 0.1);
        assert_eq!(v["valueUSD"], 60.0);
        assert_eq!(v["pairSymbol"], "WBNB");
    }
}
