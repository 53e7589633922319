//! Price engine: per-pool pair prices, USD conversion, and token-level
//! aggregation with outlier rejection and priority weighting.

pub mod agent;
pub mod bnb;
pub mod stats;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use alloy::primitives::{Address, U256, U512};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::chain::ChainClient;
use crate::classifier::raw_to_human;
use crate::constants::addr_key;
use crate::metrics::Metrics;
use crate::pool::{self, decimals::DecimalsCache};
use crate::types::{Pair, Pool, PoolKind, PriceSample, TokenPrice};

use agent::AgentRegistry;
use bnb::BnbReference;

/// Identity of a monitored token, carried through price computation.
#[derive(Debug, Clone)]
pub struct TokenMeta {
    pub address: Address,
    pub symbol: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Per-pool pair price
// ---------------------------------------------------------------------------

/// Price of the monitored token denominated in its pair token, from current
/// pool state. `None` when the pool has no usable liquidity.
pub fn pool_pair_price(pool: &Pool) -> Option<f64> {
    if !pool.has_liquidity() {
        return None;
    }

    let price = match pool.kind {
        PoolKind::V2 | PoolKind::V2Alt => {
            let (token_reserve, token_dec, pair_reserve, pair_dec) = if pool.is_token0 {
                (pool.reserve0, pool.decimals0, pool.reserve1, pool.decimals1)
            } else {
                (pool.reserve1, pool.decimals1, pool.reserve0, pool.decimals0)
            };
            let token_human = raw_to_human(token_reserve, token_dec);
            let pair_human = raw_to_human(pair_reserve, pair_dec);
            if token_human <= 0.0 {
                return None;
            }
            pair_human / token_human
        }
        PoolKind::V3 | PoolKind::V3Alt => {
            if pool.sqrt_price_x96.is_zero() {
                return None;
            }
            let ratio = q192_ratio(pool.sqrt_price_x96);
            let adjusted = ratio * 10f64.powi(pool.decimals0 as i32 - pool.decimals1 as i32);
            if pool.is_token0 {
                adjusted
            } else {
                1.0 / adjusted
            }
        }
    };

    (price.is_finite() && price > 0.0).then_some(price)
}

/// `(sqrtPriceX96 / 2^96)^2` with the square and the 10^18 scaling done in
/// 512-bit integer arithmetic before the single float division.
fn q192_ratio(sqrt_price_x96: U256) -> f64 {
    let sqrt = U512::from_be_slice(&sqrt_price_x96.to_be_bytes::<32>());
    let scaled = (sqrt * sqrt * U512::from(10u64).pow(U512::from(18u64))) >> 192usize;
    scaled.to_string().parse::<f64>().unwrap_or(0.0) / 1e18
}

fn kind_label(kind: PoolKind) -> &'static str {
    match kind {
        PoolKind::V2 => "V2",
        PoolKind::V2Alt => "V2-alt",
        PoolKind::V3 => "V3",
        PoolKind::V3Alt => "V3-alt",
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PriceEngine {
    chain: Arc<ChainClient>,
    pub decimals: Arc<DecimalsCache>,
    pub bnb: Arc<BnbReference>,
    pub agents: Arc<AgentRegistry>,
    metrics: Arc<Metrics>,
    cache: RwLock<HashMap<String, TokenPrice>>,
    threshold: f64,
}

impl PriceEngine {
    pub fn new(
        chain: Arc<ChainClient>,
        decimals: Arc<DecimalsCache>,
        bnb: Arc<BnbReference>,
        agents: Arc<AgentRegistry>,
        metrics: Arc<Metrics>,
        threshold: f64,
    ) -> Self {
        Self {
            chain,
            decimals,
            bnb,
            agents,
            metrics,
            cache: RwLock::new(HashMap::new()),
            threshold,
        }
    }

    /// Convert a pair-denominated price to `(USD, BNB)`.
    pub async fn convert_to_usd(
        &self,
        pair: Pair,
        price_in_pair: f64,
        call_stack: &[String],
    ) -> (f64, f64) {
        match pair {
            Pair::Wbnb => {
                let bnb_usd = self.bnb.get().await;
                (price_in_pair * bnb_usd, price_in_pair)
            }
            Pair::Usdt | Pair::Usdc | Pair::Busd | Pair::Dai => {
                let bnb_usd = self.bnb.get().await;
                (price_in_pair, safe_div(price_in_pair, bnb_usd))
            }
            Pair::Agent(agent_addr) => {
                let agent_usd = self
                    .agent_price_usd(agent_addr, call_stack.to_vec())
                    .await;
                let usd = price_in_pair * agent_usd;
                let bnb_usd = self.bnb.get().await;
                (usd, safe_div(usd, bnb_usd))
            }
        }
    }

    /// USD price of an agent token.
    ///
    /// The call stack carries every agent address already being resolved on
    /// this branch; re-entry returns zero instead of recursing forever.
    pub fn agent_price_usd(
        &self,
        address: Address,
        call_stack: Vec<String>,
    ) -> BoxFuture<'_, f64> {
        async move {
            let key = addr_key(&address);
            if call_stack.contains(&key) {
                warn!(agent = %key, stack = ?call_stack, "agent price cycle detected");
                self.metrics.record_error(
                    "agent-cycle",
                    format!("cycle resolving {key} via {call_stack:?}"),
                );
                return 0.0;
            }

            if let Some(price) = self.agents.cached_price(&address).await {
                return price;
            }

            let Some(entry) = self.agents.entry(&address).await else {
                warn!(agent = %key, "agent token not registered");
                return 0.0;
            };

            let mut stack = call_stack;
            stack.push(key.clone());

            let mut sources = entry.sources;
            let mut samples = Vec::new();
            for source in &mut sources {
                if source.loaded.is_none() {
                    match pool::load_pool(
                        &self.chain,
                        &self.decimals,
                        source.address,
                        source.kind,
                        address,
                        source.pair,
                        source.priority,
                    )
                    .await
                    {
                        Ok(loaded) => source.loaded = Some(loaded),
                        Err(e) => {
                            warn!(
                                agent = %key,
                                pool = %addr_key(&source.address),
                                error = %e,
                                "agent source load failed"
                            );
                            continue;
                        }
                    }
                }

                let state = source.loaded.as_mut().expect("loaded above");
                if let Err(e) = pool::refresh_state(&self.chain, state).await {
                    warn!(
                        agent = %key,
                        pool = %addr_key(&source.address),
                        error = %e,
                        "agent source refresh failed"
                    );
                    continue;
                }

                let Some(pair_price) = pool_pair_price(state) else {
                    continue;
                };
                let (usd, _) = self.convert_to_usd(source.pair, pair_price, &stack).await;
                if usd > 0.0 && usd.is_finite() {
                    samples.push(usd);
                }
            }

            if samples.is_empty() {
                warn!(agent = %key, "no positive agent price samples");
                return 0.0;
            }

            let filtered = stats::reject_outliers(&samples);
            let price = stats::mean(&filtered);
            self.agents.store(&address, price, sources).await;
            debug!(agent = %key, price = price, samples = filtered.len(), "agent price updated");
            price
        }
        .boxed()
    }

    /// Aggregate per-pool USD samples into the token's cached price.
    pub async fn compute_token_price(
        &self,
        meta: &TokenMeta,
        pools: &[Pool],
    ) -> Option<TokenPrice> {
        let mut samples = Vec::new();

        for pool in pools {
            let Some(pair_price) = pool_pair_price(pool) else {
                continue;
            };
            let (usd, bnb) = self.convert_to_usd(pool.pair, pair_price, &[]).await;
            if usd <= 0.0 || !usd.is_finite() {
                continue;
            }

            let pair_symbol = match pool.pair {
                Pair::Agent(agent_addr) => self
                    .agents
                    .symbol(&agent_addr)
                    .await
                    .unwrap_or_else(|| "AGENT".to_string()),
                other => other.symbol().to_string(),
            };

            samples.push(PriceSample {
                price_usd: usd,
                price_bnb: bnb,
                pool_address: addr_key(&pool.address),
                description: format!(
                    "{} {}/{}",
                    kind_label(pool.kind),
                    meta.symbol,
                    pair_symbol
                ),
                pair: pair_symbol,
                priority: pool.priority,
            });
        }

        if samples.is_empty() {
            return None;
        }

        let usd_values: Vec<f64> = samples.iter().map(|s| s.price_usd).collect();
        let retained = stats::reject_outliers(&usd_values);
        let surviving: Vec<PriceSample> = samples
            .into_iter()
            .filter(|s| retained.contains(&s.price_usd))
            .collect();

        let price_usd = stats::priority_weighted(
            &surviving
                .iter()
                .map(|s| (s.price_usd, s.priority))
                .collect::<Vec<_>>(),
        );
        let price_bnb = stats::priority_weighted(
            &surviving
                .iter()
                .map(|s| (s.price_bnb, s.priority))
                .collect::<Vec<_>>(),
        );

        Some(TokenPrice {
            token_address: addr_key(&meta.address),
            symbol: meta.symbol.clone(),
            name: meta.name.clone(),
            price_usd,
            price_bnb,
            pool_count: surviving.len(),
            pools: surviving,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Broadcast gate: always pass a first price, otherwise require the
    /// relative change to reach the threshold.
    pub fn should_broadcast(&self, old: f64, new: f64) -> bool {
        if old == 0.0 {
            return true;
        }
        ((new - old) / old).abs() >= self.threshold
    }

    // -- Price cache --------------------------------------------------------

    pub fn cache_price(&self, price: TokenPrice) {
        self.cache
            .write()
            .expect("price cache lock poisoned")
            .insert(price.token_address.clone(), price);
    }

    pub fn cached(&self, key: &str) -> Option<TokenPrice> {
        let found = self
            .cache
            .read()
            .expect("price cache lock poisoned")
            .get(key)
            .cloned();
        if found.is_some() {
            self.metrics.inc_cache_hits();
        } else {
            self.metrics.inc_cache_misses();
        }
        found
    }

    pub fn evict(&self, key: &str) {
        self.cache
            .write()
            .expect("price cache lock poisoned")
            .remove(key);
    }

    pub fn all_cached(&self) -> Vec<TokenPrice> {
        self.cache
            .read()
            .expect("price cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::test_pool;

    fn e18(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[test]
    fn test_v2_pair_price() {
        // 1000 MON / 10 WBNB => 0.01 BNB per MON.
        let mut pool = test_pool(PoolKind::V2);
        pool.reserve0 = e18(1000);
        pool.reserve1 = e18(10);
        pool.is_token0 = true;
        let price = pool_pair_price(&pool).unwrap();
        assert!((price - 0.01).abs() < 1e-12);

        // Monitored on the other side: 100 BNB per pair token.
        pool.is_token0 = false;
        let price = pool_pair_price(&pool).unwrap();
        assert!((price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_v2_no_liquidity() {
        let mut pool = test_pool(PoolKind::V2);
        pool.reserve0 = e18(1000);
        assert!(pool_pair_price(&pool).is_none());
    }

    #[test]
    fn test_v3_price_at_unit_sqrt() {
        // sqrtPriceX96 = 2^96 encodes a raw ratio of exactly 1.0.
        let mut pool = test_pool(PoolKind::V3);
        pool.sqrt_price_x96 = U256::from(1u64) << 96;
        pool.liquidity = U256::from(1u64);
        pool.decimals0 = 18;
        pool.decimals1 = 18;
        let price = pool_pair_price(&pool).unwrap();
        assert!((price - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_v3_decimal_adjustment_inverted_side() {
        // Raw ratio 1.0, decimals 6/18, monitored = token1 => 1e12.
        let mut pool = test_pool(PoolKind::V3);
        pool.sqrt_price_x96 = U256::from(1u64) << 96;
        pool.liquidity = U256::from(1u64);
        pool.decimals0 = 6;
        pool.decimals1 = 18;
        pool.is_token0 = false;
        let price = pool_pair_price(&pool).unwrap();
        assert!((price - 1e12).abs() / 1e12 < 1e-9);
    }

    #[test]
    fn test_q192_ratio_double_sqrt() {
        // sqrt = 2 * 2^96 => ratio 4.0.
        let ratio = q192_ratio(U256::from(2u64) << 96);
        assert!((ratio - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(10.0, 0.0), 0.0);
        assert_eq!(safe_div(10.0, 4.0), 2.5);
    }

    fn offline_engine(threshold: f64) -> PriceEngine {
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let chain = Arc::new(ChainClient::new(
            "ws://127.0.0.1:1",
            Duration::from_secs(1),
            Duration::from_secs(1),
            1,
            CancellationToken::new(),
        ));
        let decimals = Arc::new(DecimalsCache::new());
        // No reference sources: the BNB price stays at the default.
        let bnb = Arc::new(BnbReference::new(
            chain.clone(),
            decimals.clone(),
            Vec::new(),
            600.0,
            Duration::from_secs(60),
        ));
        let agents = Arc::new(AgentRegistry::new(Duration::from_secs(10)));
        PriceEngine::new(
            chain,
            decimals,
            bnb,
            agents,
            Arc::new(Metrics::new()),
            threshold,
        )
    }

    #[tokio::test]
    async fn test_compute_token_price_v2_wbnb_pair() {
        let engine = offline_engine(0.001);

        // 1000 MON vs 10 WBNB at $600/BNB => $6.00 per MON.
        let mut pool = test_pool(PoolKind::V2);
        pool.reserve0 = e18(1000);
        pool.reserve1 = e18(10);
        pool.pair = Pair::Wbnb;

        let meta = TokenMeta {
            address: pool.token0,
            symbol: "MON".to_string(),
            name: "Monitored".to_string(),
        };
        let price = engine
            .compute_token_price(&meta, std::slice::from_ref(&pool))
            .await
            .unwrap();
        assert!((price.price_usd - 6.0).abs() < 1e-9);
        assert!((price.price_bnb - 0.01).abs() < 1e-12);
        assert_eq!(price.pool_count, 1);
        assert_eq!(price.pools[0].pair, "WBNB");
    }

    #[tokio::test]
    async fn test_compute_token_price_skips_dry_pools() {
        let engine = offline_engine(0.001);

        let mut live = test_pool(PoolKind::V2);
        live.reserve0 = e18(1000);
        live.reserve1 = e18(10);

        let dry = test_pool(PoolKind::V2);

        let meta = TokenMeta {
            address: live.token0,
            symbol: "MON".to_string(),
            name: "Monitored".to_string(),
        };
        let price = engine
            .compute_token_price(&meta, &[dry, live])
            .await
            .unwrap();
        assert_eq!(price.pool_count, 1);

        // All pools dry: starvation, no price.
        let all_dry = [test_pool(PoolKind::V2)];
        assert!(engine.compute_token_price(&meta, &all_dry).await.is_none());
    }

    #[tokio::test]
    async fn test_agent_cycle_returns_zero() {
        use crate::config::AgentConfig;
        use crate::types::PoolSpec;

        let engine = offline_engine(0.001);
        let a = "0x4141414141414141414141414141414141414141";
        let b = "0x4242424242424242424242424242424242424242";
        // A priced through B and B through A.
        let cross = |addr: &str, pair_addr: &str| AgentConfig {
            address: addr.to_string(),
            symbol: "AGT".to_string(),
            sources: vec![PoolSpec {
                address: "0x9999999999999999999999999999999999999999".to_string(),
                protocol: "uniswapv2".to_string(),
                pair: "AGENT".to_string(),
                pair_address: Some(pair_addr.to_string()),
                priority: 1,
                fee: None,
            }],
        };
        engine
            .agents
            .register_all(&[cross(a, b), cross(b, a)])
            .await
            .unwrap();

        let addr_a = crate::types::parse_address(a).unwrap();
        // The source pool load fails offline before the recursion is even
        // reached, but a pre-populated call stack exercises the guard.
        let price = engine
            .agent_price_usd(addr_a, vec![addr_key(&addr_a)])
            .await;
        assert_eq!(price, 0.0);
    }

    #[test]
    fn test_should_broadcast_threshold() {
        let engine = offline_engine(0.001);
        assert!(engine.should_broadcast(0.0, 5.0));
        assert!(engine.should_broadcast(100.0, 100.2));
        assert!(!engine.should_broadcast(100.0, 100.05));
        assert!(engine.should_broadcast(100.0, 99.8));
    }
}
