//! BNB/USD reference price derived from configured V3 stable pools.
//!
//! Each source pool pairs WBNB with a USD stable; the monitored side is WBNB,
//! so the pair-denominated price is BNB/USD directly regardless of which side
//! WBNB sits on. Sources are outlier-filtered and averaged. On total failure
//! the last value is retained (or the configured default on cold start).

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use tracing::{debug, warn};

use crate::chain::ChainClient;
use crate::constants::{self, addr_key};
use crate::pool::{self, decimals::DecimalsCache};
use crate::price::stats;
use crate::types::{Pair, Pool, PoolKind};

pub struct BnbReference {
    chain: Arc<ChainClient>,
    decimals: Arc<DecimalsCache>,
    source_addrs: Vec<Address>,
    /// Source pool metadata, loaded lazily on first refresh.
    sources: tokio::sync::Mutex<Vec<Option<Pool>>>,
    /// Latest value and when it was derived; `None` before the first refresh.
    value: RwLock<(f64, Option<Instant>)>,
    refresh_interval: Duration,
}

impl BnbReference {
    pub fn new(
        chain: Arc<ChainClient>,
        decimals: Arc<DecimalsCache>,
        source_addrs: Vec<Address>,
        default_price: f64,
        refresh_interval: Duration,
    ) -> Self {
        let slots = vec![None; source_addrs.len()];
        Self {
            chain,
            decimals,
            source_addrs,
            sources: tokio::sync::Mutex::new(slots),
            value: RwLock::new((default_price, None)),
            refresh_interval,
        }
    }

    /// Current BNB/USD, refreshing lazily when stale.
    pub async fn get(&self) -> f64 {
        let (value, updated) = *self.value.read().expect("bnb value lock poisoned");
        if let Some(updated) = updated {
            if updated.elapsed() < self.refresh_interval {
                return value;
            }
        }
        self.refresh().await
    }

    /// Peek without refreshing.
    pub fn current(&self) -> f64 {
        self.value.read().expect("bnb value lock poisoned").0
    }

    /// Re-derive from all sources. Retains the previous value when every
    /// source fails.
    pub async fn refresh(&self) -> f64 {
        let mut samples = Vec::new();

        {
            let mut sources = self.sources.lock().await;
            for (i, addr) in self.source_addrs.iter().enumerate() {
                if sources[i].is_none() {
                    match pool::load_pool(
                        &self.chain,
                        &self.decimals,
                        *addr,
                        PoolKind::V3,
                        constants::WBNB,
                        Pair::Usdt,
                        1,
                    )
                    .await
                    {
                        Ok(loaded) => {
                            let other = if loaded.is_token0 {
                                loaded.token1
                            } else {
                                loaded.token0
                            };
                            if !constants::is_stable(&other) {
                                warn!(
                                    pool = %addr_key(addr),
                                    "BNB reference pool is not a WBNB/stable pair, skipping"
                                );
                                continue;
                            }
                            sources[i] = Some(loaded);
                        }
                        Err(e) => {
                            warn!(pool = %addr_key(addr), error = %e, "BNB reference pool load failed");
                            continue;
                        }
                    }
                }

                let source = sources[i].as_mut().expect("source loaded above");
                if let Err(e) = pool::refresh_state(&self.chain, source).await {
                    warn!(pool = %addr_key(addr), error = %e, "BNB reference refresh failed");
                    continue;
                }
                if let Some(price) = super::pool_pair_price(source) {
                    if price > 0.0 && price.is_finite() {
                        samples.push(price);
                    }
                }
            }
        }

        if samples.is_empty() {
            let previous = self.current();
            warn!(
                retained = previous,
                "all BNB reference sources failed, retaining last value"
            );
            // Stamp anyway so a dead node does not trigger a refresh per read.
            *self.value.write().expect("bnb value lock poisoned") =
                (previous, Some(Instant::now()));
            return previous;
        }

        let filtered = stats::reject_outliers(&samples);
        let price = stats::mean(&filtered);
        *self.value.write().expect("bnb value lock poisoned") = (price, Some(Instant::now()));
        debug!(
            price = price,
            sources = samples.len(),
            surviving = filtered.len(),
            "BNB/USD reference updated"
        );
        price
    }

    /// Background refresh loop driven by the coordinator.
    pub async fn run_refresher(&self, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval) => {
                    self.refresh().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("BNB reference refresher shutting down");
                    return;
                }
            }
        }
    }
}
