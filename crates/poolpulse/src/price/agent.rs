//! Agent-token registry.
//!
//! An agent token's USD price is derived from other pools rather than a
//! direct stable pair, and those pools may themselves be paired with other
//! agent tokens. The registry holds the source definitions and a short-lived
//! price cache; the recursive resolution (with its cycle guard) lives on the
//! price engine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::AgentConfig;
use crate::constants::addr_key;
use crate::errors::{FeedError, Result};
use crate::types::{parse_address, Pair, Pool, Protocol};

#[derive(Clone)]
pub struct AgentSource {
    pub address: Address,
    pub kind: crate::types::PoolKind,
    pub pair: Pair,
    pub priority: u32,
    /// Metadata loaded on first use; refreshed state is fetched per read.
    pub loaded: Option<Pool>,
}

#[derive(Clone)]
pub struct AgentEntry {
    pub address: Address,
    pub symbol: String,
    pub sources: Vec<AgentSource>,
    pub cached: Option<(f64, Instant)>,
}

pub struct AgentRegistry {
    entries: RwLock<HashMap<String, AgentEntry>>,
    ttl: Duration,
}

impl AgentRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Register entries from configuration. Invalid entries fail the load.
    pub async fn register_all(&self, configs: &[AgentConfig]) -> Result<()> {
        for cfg in configs {
            let address = parse_address(&cfg.address)?;
            let mut sources = Vec::with_capacity(cfg.sources.len());
            for spec in &cfg.sources {
                let pool_addr = parse_address(&spec.address)?;
                let protocol = Protocol::from_tag(&spec.protocol)?;
                let pair_address = spec
                    .pair_address
                    .as_deref()
                    .map(parse_address)
                    .transpose()?;
                let pair = Pair::from_spec(&spec.pair, pair_address)?;
                sources.push(AgentSource {
                    address: pool_addr,
                    kind: protocol.kind(),
                    pair,
                    priority: spec.priority,
                    loaded: None,
                });
            }
            if sources.is_empty() {
                return Err(FeedError::Config(format!(
                    "agent token {} has no price sources",
                    cfg.address
                )));
            }

            info!(
                agent = %addr_key(&address),
                symbol = %cfg.symbol,
                sources = sources.len(),
                "registered agent token"
            );
            self.entries.write().await.insert(
                addr_key(&address),
                AgentEntry {
                    address,
                    symbol: cfg.symbol.clone(),
                    sources,
                    cached: None,
                },
            );
        }
        Ok(())
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.entries.read().await.contains_key(&addr_key(address))
    }

    pub async fn symbol(&self, address: &Address) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&addr_key(address))
            .map(|e| e.symbol.clone())
    }

    /// Snapshot an entry for computation outside the lock.
    pub async fn entry(&self, address: &Address) -> Option<AgentEntry> {
        self.entries.read().await.get(&addr_key(address)).cloned()
    }

    /// Fresh cached price, if within TTL.
    pub async fn cached_price(&self, address: &Address) -> Option<f64> {
        let entries = self.entries.read().await;
        let entry = entries.get(&addr_key(address))?;
        let (price, at) = entry.cached?;
        (at.elapsed() < self.ttl).then_some(price)
    }

    /// Store a computed price and the (possibly newly loaded) sources.
    /// The lock is held only around the put.
    pub async fn store(&self, address: &Address, price: f64, sources: Vec<AgentSource>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&addr_key(address)) {
            entry.cached = Some((price, Instant::now()));
            entry.sources = sources;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoolSpec;

    fn agent_cfg(addr: &str, sources: Vec<PoolSpec>) -> AgentConfig {
        AgentConfig {
            address: addr.to_string(),
            symbol: "AGT".to_string(),
            sources,
        }
    }

    fn source_spec(addr: &str, pair: &str, pair_address: Option<&str>) -> PoolSpec {
        PoolSpec {
            address: addr.to_string(),
            protocol: "uniswapv2".to_string(),
            pair: pair.to_string(),
            pair_address: pair_address.map(str::to_string),
            priority: 1,
            fee: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = AgentRegistry::new(Duration::from_secs(10));
        registry
            .register_all(&[agent_cfg(
                "0x4444444444444444444444444444444444444444",
                vec![source_spec(
                    "0x5555555555555555555555555555555555555555",
                    "WBNB",
                    None,
                )],
            )])
            .await
            .unwrap();

        let addr = parse_address("0x4444444444444444444444444444444444444444").unwrap();
        assert!(registry.contains(&addr).await);
        assert_eq!(registry.symbol(&addr).await.as_deref(), Some("AGT"));
        assert!(registry.cached_price(&addr).await.is_none());
    }

    #[tokio::test]
    async fn test_store_and_cached_price() {
        let registry = AgentRegistry::new(Duration::from_secs(10));
        registry
            .register_all(&[agent_cfg(
                "0x4444444444444444444444444444444444444444",
                vec![source_spec(
                    "0x5555555555555555555555555555555555555555",
                    "USDT",
                    None,
                )],
            )])
            .await
            .unwrap();

        let addr = parse_address("0x4444444444444444444444444444444444444444").unwrap();
        let sources = registry.entry(&addr).await.unwrap().sources;
        registry.store(&addr, 1.25, sources).await;
        assert_eq!(registry.cached_price(&addr).await, Some(1.25));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let registry = AgentRegistry::new(Duration::from_millis(0));
        registry
            .register_all(&[agent_cfg(
                "0x4444444444444444444444444444444444444444",
                vec![source_spec(
                    "0x5555555555555555555555555555555555555555",
                    "USDT",
                    None,
                )],
            )])
            .await
            .unwrap();

        let addr = parse_address("0x4444444444444444444444444444444444444444").unwrap();
        let sources = registry.entry(&addr).await.unwrap().sources;
        registry.store(&addr, 1.25, sources).await;
        // Zero TTL: immediately stale.
        assert!(registry.cached_price(&addr).await.is_none());
    }

    #[tokio::test]
    async fn test_agent_without_sources_rejected() {
        let registry = AgentRegistry::new(Duration::from_secs(10));
        let err = registry
            .register_all(&[agent_cfg(
                "0x4444444444444444444444444444444444444444",
                vec![],
            )])
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }
}
