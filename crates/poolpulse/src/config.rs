//! Configuration for the feed service binary.
//!
//! Loads from environment variables with sensible defaults.
//! Optionally loads a JSON config file if `POOLPULSE_CONFIG_PATH` is set;
//! environment variables win over the file.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::constants;
use crate::types::TokenConfig;

/// Runtime configuration for the feed service.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Node WebSocket URL (required).
    pub node_ws_url: String,
    /// Bind address for the client fan-out socket.
    pub listen_addr: String,
    /// Downstream confirmation consumer WebSocket URL, if any.
    pub confirm_url: Option<String>,
    /// Minimum relative price change that triggers a broadcast.
    pub price_update_threshold: f64,
    /// BNB/USD reference refresh interval (seconds).
    pub bnb_refresh_interval_secs: u64,
    /// Agent-token price cache TTL (seconds).
    pub agent_cache_ttl_secs: u64,
    /// Pending swap timeout before `timedOut` (seconds).
    pub pending_timeout_secs: u64,
    /// Heartbeat fan-out interval (seconds).
    pub heartbeat_interval_secs: u64,
    /// Stale-session sweep interval (seconds).
    pub reaper_interval_secs: u64,
    /// Sessions silent longer than this are reaped (seconds).
    pub stale_session_secs: u64,
    /// Price-recompute coalescing window (milliseconds).
    pub coalesce_window_ms: u64,
    /// Delay between node reconnect attempts (seconds).
    pub reconnect_delay_secs: u64,
    /// Maximum node reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Per-request RPC timeout (seconds).
    pub rpc_timeout_secs: u64,
    /// LRU dedup capacity for mempool tx hashes.
    pub dedup_cache_size: usize,
    /// BNB/USD used before the first successful reference read.
    pub default_bnb_price: f64,
    /// V3 pools the BNB/USD reference is derived from.
    pub bnb_reference_pools: Vec<String>,
    /// Statically configured token bindings.
    pub tokens: Vec<TokenConfig>,
    /// Agent-token registry entries.
    pub agents: Vec<AgentConfig>,
    /// Suppresses error detail on the client protocol when true.
    pub production: bool,
}

/// An agent token whose USD price is derived from other pools.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub address: String,
    pub symbol: String,
    pub sources: Vec<crate::types::PoolSpec>,
}

/// Optional JSON config overlay.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonConfig {
    node_ws_url: Option<String>,
    listen_addr: Option<String>,
    confirm_url: Option<String>,
    price_update_threshold: Option<f64>,
    bnb_refresh_interval_secs: Option<u64>,
    agent_cache_ttl_secs: Option<u64>,
    pending_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    reaper_interval_secs: Option<u64>,
    stale_session_secs: Option<u64>,
    coalesce_window_ms: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    rpc_timeout_secs: Option<u64>,
    dedup_cache_size: Option<usize>,
    default_bnb_price: Option<f64>,
    bnb_reference_pools: Option<Vec<String>>,
    tokens: Option<Vec<TokenConfig>>,
    agents: Option<Vec<AgentConfig>>,
}

impl FeedConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// If `POOLPULSE_CONFIG_PATH` is set, loads a JSON file first and overlays
    /// environment variables on top.
    pub fn from_env() -> Result<Self> {
        let json_cfg = match std::env::var("POOLPULSE_CONFIG_PATH").ok() {
            Some(path) if !path.is_empty() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file: {path}"))?;
                serde_json::from_str::<JsonConfig>(&contents)
                    .with_context(|| format!("failed to parse config file: {path}"))?
            }
            _ => JsonConfig::default(),
        };

        let node_ws_url = env_string("NODE_WS_URL")
            .or(json_cfg.node_ws_url)
            .context("NODE_WS_URL is required")?;

        let listen_addr = env_string("POOLPULSE_LISTEN_ADDR")
            .or(json_cfg.listen_addr)
            .unwrap_or_else(|| "0.0.0.0:8081".to_string());

        let confirm_url = env_string("CONFIRMATION_WS_URL")
            .or(json_cfg.confirm_url)
            .map(|base| match env_string("CONFIRMATION_WS_PATH") {
                Some(path) => format!("{}{}", base.trim_end_matches('/'), path),
                None => base,
            });

        let bnb_reference_pools = json_cfg.bnb_reference_pools.unwrap_or_else(|| {
            constants::BNB_REFERENCE_POOLS
                .iter()
                .map(constants::addr_key)
                .collect()
        });

        let production = std::env::var("NODE_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Ok(Self {
            node_ws_url,
            listen_addr,
            confirm_url,
            price_update_threshold: env_parse("POOLPULSE_PRICE_THRESHOLD")
                .or(json_cfg.price_update_threshold)
                .unwrap_or(0.001),
            bnb_refresh_interval_secs: env_parse("POOLPULSE_BNB_REFRESH_SECS")
                .or(json_cfg.bnb_refresh_interval_secs)
                .unwrap_or(60),
            agent_cache_ttl_secs: env_parse("POOLPULSE_AGENT_TTL_SECS")
                .or(json_cfg.agent_cache_ttl_secs)
                .unwrap_or(10),
            pending_timeout_secs: env_parse("POOLPULSE_PENDING_TIMEOUT_SECS")
                .or(json_cfg.pending_timeout_secs)
                .unwrap_or(300),
            heartbeat_interval_secs: env_parse("POOLPULSE_HEARTBEAT_SECS")
                .or(json_cfg.heartbeat_interval_secs)
                .unwrap_or(30),
            reaper_interval_secs: env_parse("POOLPULSE_REAPER_SECS")
                .or(json_cfg.reaper_interval_secs)
                .unwrap_or(30),
            stale_session_secs: env_parse("POOLPULSE_STALE_SESSION_SECS")
                .or(json_cfg.stale_session_secs)
                .unwrap_or(60),
            coalesce_window_ms: env_parse("POOLPULSE_COALESCE_MS")
                .or(json_cfg.coalesce_window_ms)
                .unwrap_or(100),
            reconnect_delay_secs: env_parse("POOLPULSE_RECONNECT_DELAY")
                .or(json_cfg.reconnect_delay_secs)
                .unwrap_or(5),
            max_reconnect_attempts: env_parse("POOLPULSE_MAX_RECONNECT")
                .or(json_cfg.max_reconnect_attempts)
                .unwrap_or(10),
            rpc_timeout_secs: env_parse("POOLPULSE_RPC_TIMEOUT_SECS")
                .or(json_cfg.rpc_timeout_secs)
                .unwrap_or(15),
            dedup_cache_size: env_parse("POOLPULSE_DEDUP_CACHE_SIZE")
                .or(json_cfg.dedup_cache_size)
                .unwrap_or(100_000),
            default_bnb_price: env_parse("POOLPULSE_DEFAULT_BNB_PRICE")
                .or(json_cfg.default_bnb_price)
                .unwrap_or(600.0),
            bnb_reference_pools,
            tokens: json_cfg.tokens.unwrap_or_default(),
            agents: json_cfg.agents.unwrap_or_default(),
            production,
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Parse an environment variable into a type that implements `FromStr`.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_overlay_parses() {
        let raw = r#"{
            "nodeWsUrl": "wss://bsc.example/ws",
            "priceUpdateThreshold": 0.005,
            "tokens": [{
                "address": "0x1111111111111111111111111111111111111111",
                "symbol": "TKN",
                "name": "Test Token",
                "pools": [{
                    "address": "0x2222222222222222222222222222222222222222",
                    "protocol": "uniswapv2",
                    "pair": "WBNB",
                    "priority": 2
                }]
            }],
            "agents": [{
                "address": "0x3333333333333333333333333333333333333333",
                "symbol": "AGT",
                "sources": [{
                    "address": "0x4444444444444444444444444444444444444444",
                    "protocol": "uniswapv3",
                    "pair": "USDT"
                }]
            }]
        }"#;

        let cfg: JsonConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.node_ws_url.as_deref(), Some("wss://bsc.example/ws"));
        assert_eq!(cfg.price_update_threshold, Some(0.005));

        let tokens = cfg.tokens.unwrap();
        assert_eq!(tokens[0].pools[0].priority, 2);
        assert_eq!(tokens[0].decimals, constants::DEFAULT_DECIMALS);

        let agents = cfg.agents.unwrap();
        assert_eq!(agents[0].symbol, "AGT");
        assert_eq!(agents[0].sources[0].priority, 1);
    }
}
