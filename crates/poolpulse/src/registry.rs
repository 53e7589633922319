//! Listener registry: the mapping from monitored token to its active pool
//! listeners.
//!
//! Mutating operations (add, remove, resubscribe) and swap-log handlers for
//! the same token serialize on the binding's async mutex; independent tokens
//! proceed concurrently. Every listener owns a teardown path that cancels its
//! task and releases the chain subscription exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, SubscriptionHandle};
use crate::classifier;
use crate::constants::addr_key;
use crate::errors::{FeedError, Result};
use crate::fanout::{FanoutHub, SwapEventMsg};
use crate::mempool::MempoolTracker;
use crate::metrics::Metrics;
use crate::pool;
use crate::price::{PriceEngine, TokenMeta};
use crate::types::{
    parse_address, AddResult, DynamicTokenSpec, LogEvent, Pair, Pool, PoolSpec, Protocol,
    SwapLog, TokenConfig, TokenPrice,
};

/// One monitored token with its live pools and price state.
pub struct TokenBinding {
    pub meta: TokenMeta,
    pub config: TokenConfig,
    pub is_dynamic: bool,
    pub state: Mutex<BindingState>,
}

pub struct BindingState {
    pub pools: Vec<Pool>,
    /// Last broadcast price in USD; zero before the first broadcast.
    pub last_price: f64,
    /// Coalescing stamp for price recomputation.
    pub last_update_call: Option<Instant>,
}

/// A live pool listener. Teardown cancels the forwarding task and releases
/// the chain subscription; both happen at most once.
pub struct ListenerHandle {
    pool_address: Address,
    token_address: Address,
    cancel: CancellationToken,
    subscription: Arc<SubscriptionHandle>,
    torn_down: AtomicBool,
}

impl ListenerHandle {
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.subscription.cancel().await;
        debug!(
            pool = %addr_key(&self.pool_address),
            token = %addr_key(&self.token_address),
            "listener torn down"
        );
    }
}

fn handle_key(pool: &Address, token: &Address) -> String {
    format!("{}:{}", addr_key(pool), addr_key(token))
}

pub struct ListenerRegistry {
    chain: Arc<ChainClient>,
    engine: Arc<PriceEngine>,
    fanout: Arc<FanoutHub>,
    mempool: Arc<MempoolTracker>,
    metrics: Arc<Metrics>,
    static_tokens: Vec<TokenConfig>,
    coalesce_window: Duration,
    bindings: RwLock<HashMap<String, Arc<TokenBinding>>>,
    handles: Mutex<HashMap<String, Arc<ListenerHandle>>>,
}

impl ListenerRegistry {
    pub fn new(
        chain: Arc<ChainClient>,
        engine: Arc<PriceEngine>,
        fanout: Arc<FanoutHub>,
        mempool: Arc<MempoolTracker>,
        metrics: Arc<Metrics>,
        static_tokens: Vec<TokenConfig>,
        coalesce_window: Duration,
    ) -> Self {
        Self {
            chain,
            engine,
            fanout,
            mempool,
            metrics,
            static_tokens,
            coalesce_window,
            bindings: RwLock::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    // -- Public operation surface -------------------------------------------

    /// Add a statically configured token. Idempotent: an existing binding
    /// returns its cached price untouched.
    pub async fn add_token(self: &Arc<Self>, address: Address) -> Result<Option<TokenPrice>> {
        let key = addr_key(&address);
        if self.bindings.read().await.contains_key(&key) {
            return Ok(self.engine.cached(&key));
        }

        let config = self
            .static_tokens
            .iter()
            .find(|t| t.address.eq_ignore_ascii_case(&key))
            .cloned()
            .ok_or_else(|| FeedError::Config(format!("token {key} is not configured")))?;

        let binding = Arc::new(TokenBinding {
            meta: TokenMeta {
                address,
                symbol: config.symbol.clone(),
                name: config.name.clone(),
            },
            config: config.clone(),
            is_dynamic: false,
            state: Mutex::new(BindingState {
                pools: Vec::new(),
                last_price: 0.0,
                last_update_call: None,
            }),
        });

        let pools = self.load_pools(&binding.meta, &config.pools).await;
        self.register_binding(binding, pools).await
    }

    /// Add a token from a request payload. Pool load and validation failures
    /// reject the add without mutating the registry.
    pub async fn add_dynamic_token(
        self: &Arc<Self>,
        spec: &DynamicTokenSpec,
    ) -> Result<Option<TokenPrice>> {
        let address = parse_address(&spec.token_address)?;
        let key = addr_key(&address);
        if self.bindings.read().await.contains_key(&key) {
            return Ok(self.engine.cached(&key));
        }

        let pool_address = parse_address(&spec.pool_address)?;
        let protocol = Protocol::from_tag(&spec.protocol)?;
        let pair_address = spec
            .pair_address
            .as_deref()
            .map(parse_address)
            .transpose()?;
        let pair = Pair::from_spec(&spec.pair_type, pair_address)?;

        let symbol = spec.symbol.clone().unwrap_or_else(|| "TOKEN".to_string());
        let config = TokenConfig {
            address: key.clone(),
            symbol: symbol.clone(),
            name: spec.name.clone().unwrap_or_else(|| symbol.clone()),
            decimals: crate::constants::DEFAULT_DECIMALS,
            pools: vec![PoolSpec {
                address: addr_key(&pool_address),
                protocol: protocol.tag().to_string(),
                pair: spec.pair_type.to_ascii_uppercase(),
                pair_address: pair_address.as_ref().map(addr_key),
                priority: spec.priority.unwrap_or(1),
                fee: spec.fee,
            }],
        };

        // The single pool must load and validate; unlike the static path
        // this failure surfaces to the caller.
        let loaded = pool::load_pool(
            &self.chain,
            &self.engine.decimals,
            pool_address,
            protocol.kind(),
            address,
            pair,
            spec.priority.unwrap_or(1),
        )
        .await?;

        let binding = Arc::new(TokenBinding {
            meta: TokenMeta {
                address,
                symbol: config.symbol.clone(),
                name: config.name.clone(),
            },
            config,
            is_dynamic: true,
            state: Mutex::new(BindingState {
                pools: Vec::new(),
                last_price: 0.0,
                last_update_call: None,
            }),
        });

        self.register_binding(binding, vec![loaded]).await
    }

    /// Batch dynamic add; each spec succeeds or fails independently.
    pub async fn add_dynamic_tokens(self: &Arc<Self>, specs: &[DynamicTokenSpec]) -> Vec<AddResult> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let result = self.add_dynamic_token(spec).await;
            results.push(match result {
                Ok(Some(price)) => AddResult {
                    token_address: price.token_address.clone(),
                    ok: true,
                    error: None,
                    price: Some(price),
                },
                Ok(None) => AddResult {
                    token_address: spec.token_address.to_ascii_lowercase(),
                    ok: false,
                    error: Some("no live pools for token".to_string()),
                    price: None,
                },
                Err(e) => AddResult {
                    token_address: spec.token_address.to_ascii_lowercase(),
                    ok: false,
                    error: Some(e.to_string()),
                    price: None,
                },
            });
        }
        results
    }

    /// Tear down every listener for a token, evict its cached price, and
    /// drop any mempool tracking that refers to its pools.
    pub async fn remove_token(&self, address: Address) -> bool {
        let key = addr_key(&address);
        let removed = self.bindings.write().await.remove(&key);
        if removed.is_none() {
            return false;
        }

        self.teardown_token_handles(&key).await;
        self.engine.evict(&key);
        self.mempool.remove_pools_for_token(&key).await;
        info!(token = %key, "token removed");
        true
    }

    /// `remove_token` restricted to dynamically added bindings.
    pub async fn remove_dynamic_token(&self, address: Address) -> bool {
        let key = addr_key(&address);
        let is_dynamic = self
            .bindings
            .read()
            .await
            .get(&key)
            .map(|b| b.is_dynamic)
            .unwrap_or(false);
        if !is_dynamic {
            return false;
        }
        self.remove_token(address).await
    }

    /// Room-empty teardown: dynamic bindings are removed outright, static
    /// ones torn down until the next subscription re-adds them.
    pub async fn on_room_empty(&self, address: Address) {
        let key = addr_key(&address);
        let binding = self.bindings.read().await.get(&key).cloned();
        if let Some(binding) = binding {
            debug!(token = %key, dynamic = binding.is_dynamic, "room empty, removing binding");
            self.remove_token(address).await;
        }
    }

    /// Re-establish every binding's subscriptions after a reconnect without
    /// recomputing their configs.
    pub async fn on_reconnect(self: &Arc<Self>) {
        let bindings: Vec<Arc<TokenBinding>> =
            self.bindings.read().await.values().cloned().collect();
        info!(count = bindings.len(), "resubscribing bindings after reconnect");

        for binding in bindings {
            let key = addr_key(&binding.meta.address);
            self.teardown_token_handles(&key).await;

            let pools = self.load_pools(&binding.meta, &binding.config.pools).await;
            if pools.is_empty() {
                warn!(token = %key, "no live pools after reconnect");
                continue;
            }
            if let Err(e) = self.attach_listeners(&binding, &pools).await {
                warn!(token = %key, error = %e, "resubscribe failed");
                continue;
            }
            {
                let mut state = binding.state.lock().await;
                state.pools = pools;
            }
            self.recompute_and_maybe_broadcast(&binding).await;
        }
    }

    pub async fn monitored_tokens(&self) -> Vec<String> {
        self.bindings.read().await.keys().cloned().collect()
    }

    pub async fn is_monitored(&self, address: &Address) -> bool {
        self.bindings.read().await.contains_key(&addr_key(address))
    }

    pub fn token_price(&self, address: &Address) -> Option<TokenPrice> {
        self.engine.cached(&addr_key(address))
    }

    // -- Internals ----------------------------------------------------------

    /// Load every configured pool for a binding, filtering failures and dry
    /// pools. Static configs tolerate individual pool failures.
    async fn load_pools(&self, meta: &TokenMeta, specs: &[PoolSpec]) -> Vec<Pool> {
        let mut pools = Vec::with_capacity(specs.len());
        for spec in specs {
            let loaded = async {
                let pool_address = parse_address(&spec.address)?;
                let protocol = Protocol::from_tag(&spec.protocol)?;
                let pair_address = spec
                    .pair_address
                    .as_deref()
                    .map(parse_address)
                    .transpose()?;
                let pair = Pair::from_spec(&spec.pair, pair_address)?;
                pool::load_pool(
                    &self.chain,
                    &self.engine.decimals,
                    pool_address,
                    protocol.kind(),
                    meta.address,
                    pair,
                    spec.priority,
                )
                .await
            }
            .await;

            match loaded {
                Ok(pool) if pool.has_liquidity() => pools.push(pool),
                Ok(pool) => {
                    debug!(
                        pool = %addr_key(&pool.address),
                        token = %addr_key(&meta.address),
                        "pool has no liquidity, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        pool = %spec.address,
                        token = %addr_key(&meta.address),
                        error = %e,
                        "pool load failed, skipping"
                    );
                    self.metrics.record_error("pool-load", e.to_string());
                }
            }
        }
        pools
    }

    /// Common tail of both add paths: warm price dependencies, subscribe,
    /// store, compute and broadcast the initial price.
    async fn register_binding(
        self: &Arc<Self>,
        binding: Arc<TokenBinding>,
        pools: Vec<Pool>,
    ) -> Result<Option<TokenPrice>> {
        let key = addr_key(&binding.meta.address);

        let live: Vec<Pool> = pools.into_iter().filter(Pool::has_liquidity).collect();
        if live.is_empty() {
            // Starvation: nothing to monitor, nothing mutated.
            warn!(token = %key, "no live pools, token not added");
            return Ok(None);
        }

        // Warm the BNB reference and any agent dependencies before pricing.
        self.engine.bnb.get().await;
        for pool in &live {
            if let Pair::Agent(agent_addr) = pool.pair {
                self.engine.agent_price_usd(agent_addr, Vec::new()).await;
            }
        }

        self.attach_listeners(&binding, &live).await?;

        let initial = self.engine.compute_token_price(&binding.meta, &live).await;
        {
            let mut state = binding.state.lock().await;
            state.pools = live;
            if let Some(price) = &initial {
                state.last_price = price.price_usd;
            }
        }

        self.bindings
            .write()
            .await
            .insert(key.clone(), binding.clone());

        if let Some(price) = &initial {
            self.engine.cache_price(price.clone());
            if price.price_usd > 0.0 {
                self.metrics.inc_price_updates();
                self.fanout.broadcast_price_update(price).await;
            }
        }

        let pool_count = binding.state.lock().await.pools.len();
        info!(
            token = %key,
            symbol = %binding.meta.symbol,
            pools = pool_count,
            dynamic = binding.is_dynamic,
            "token added"
        );
        Ok(initial)
    }

    /// Subscribe to each pool's swap topic and spawn its forwarding task.
    async fn attach_listeners(
        self: &Arc<Self>,
        binding: &Arc<TokenBinding>,
        pools: &[Pool],
    ) -> Result<()> {
        for pool in pools {
            let key = handle_key(&pool.address, &binding.meta.address);

            // Duplicate-listener guard: sweep any entry whose key lowercases
            // to the same value and tear it down before inserting.
            let duplicates: Vec<Arc<ListenerHandle>> = {
                let handles = self.handles.lock().await;
                handles
                    .iter()
                    .filter(|(k, _)| k.to_ascii_lowercase() == key)
                    .map(|(_, h)| h.clone())
                    .collect()
            };
            for duplicate in duplicates {
                warn!(key = %key, "tearing down duplicate listener");
                duplicate.teardown().await;
            }
            self.handles
                .lock()
                .await
                .retain(|k, _| k.to_ascii_lowercase() != key);

            let subscription = self
                .chain
                .subscribe_logs(pool.address, pool.kind.swap_topic())
                .await?;

            let cancel = CancellationToken::new();
            let handle = Arc::new(ListenerHandle {
                pool_address: pool.address,
                token_address: binding.meta.address,
                cancel: cancel.clone(),
                subscription: Arc::new(subscription.handle),
                torn_down: AtomicBool::new(false),
            });

            let registry = self.clone();
            let task_binding = binding.clone();
            let pool_address = pool.address;
            let mut rx = subscription.rx;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => {
                            match event {
                                Some(event) => {
                                    registry
                                        .handle_swap_event(&task_binding, pool_address, event)
                                        .await;
                                }
                                // Stream death means the connection dropped;
                                // resubscription arrives via on_reconnect.
                                None => break,
                            }
                        }
                    }
                }
            });

            self.handles.lock().await.insert(key, handle);
        }
        Ok(())
    }

    async fn teardown_token_handles(&self, token_key: &str) {
        let suffix = format!(":{token_key}");
        let removed: Vec<Arc<ListenerHandle>> = {
            let mut handles = self.handles.lock().await;
            let keys: Vec<String> = handles
                .keys()
                .filter(|k| k.ends_with(&suffix))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| handles.remove(k)).collect()
        };
        for handle in removed {
            handle.teardown().await;
        }
    }

    /// Swap-log entry point. Decodes synchronously, emits the swap event
    /// with data already in hand, then spawns the RPC-dependent batch.
    async fn handle_swap_event(
        self: &Arc<Self>,
        binding: &Arc<TokenBinding>,
        pool_address: Address,
        event: LogEvent,
    ) {
        self.metrics.inc_events_received();
        let token_key = addr_key(&binding.meta.address);

        let swap = {
            let mut state = binding.state.lock().await;
            let Some(pool) = state.pools.iter_mut().find(|p| p.address == pool_address) else {
                return;
            };

            let log = match pool::decode_swap_log(pool.kind, &event) {
                Ok(log) => log,
                Err(e) => {
                    self.metrics.record_error("swap-decode", e.to_string());
                    warn!(pool = %addr_key(&pool_address), error = %e, "swap log decode failed");
                    return;
                }
            };

            // V3 logs carry the post-swap price state; fold it in now.
            if let SwapLog::V3 {
                sqrt_price_x96,
                liquidity,
                ..
            } = &log
            {
                pool.sqrt_price_x96 = *sqrt_price_x96;
                pool.liquidity = *liquidity;
            }

            let info = classifier::classify(pool, &log);
            let cached = self.engine.cached(&token_key);
            let price_usd = cached.as_ref().map(|p| p.price_usd).unwrap_or(0.0);
            let value_usd = info.token_amount * price_usd;
            let bnb_usd = self.engine.bnb.current();
            let amount_bnb = match pool.pair {
                Pair::Wbnb => info.pair_amount,
                _ if bnb_usd > 0.0 => value_usd / bnb_usd,
                _ => 0.0,
            };
            let pair_symbol = cached
                .as_ref()
                .and_then(|p| {
                    p.pools
                        .iter()
                        .find(|s| s.pool_address == addr_key(&pool_address))
                        .map(|s| s.pair.clone())
                })
                .unwrap_or_else(|| pool.pair.symbol().to_string());

            SwapEventMsg {
                token_address: token_key.clone(),
                symbol: binding.meta.symbol.clone(),
                pool_address: addr_key(&pool_address),
                tx_hash: format!("{:?}", event.tx_hash),
                kind: if info.is_buy { "buy" } else { "sell" }.to_string(),
                // The real originating address is resolved in the follow-up
                // swap-update; see the background batch below.
                sender: String::new(),
                amount_bnb,
                amount_token: info.token_amount,
                pair_symbol,
                pair_amount: info.pair_amount,
                price_usd,
                value_usd,
                timestamp: chrono::Utc::now().to_rfc3339(),
            }
        };

        // Emit immediately, before any RPC round-trip.
        self.fanout.broadcast_swap_event(&token_key, &swap).await;

        // Background batch: V2 reserve refresh, price recompute + broadcast,
        // sender resolution.
        let registry = self.clone();
        let binding = binding.clone();
        let tx_hash = event.tx_hash;
        tokio::spawn(async move {
            let token_key = addr_key(&binding.meta.address);

            {
                let mut state = binding.state.lock().await;
                if let Some(pool) = state.pools.iter_mut().find(|p| p.address == pool_address) {
                    if !pool.kind.is_v3() {
                        if let Err(e) = pool::refresh_state(&registry.chain, pool).await {
                            registry.metrics.record_error("reserve-refresh", e.to_string());
                        }
                    }
                }
            }

            registry.recompute_and_maybe_broadcast(&binding).await;

            match registry.chain.transaction_by_hash(tx_hash).await {
                Ok(Some(tx)) => {
                    registry
                        .fanout
                        .broadcast_swap_update(
                            &token_key,
                            &format!("{tx_hash:?}"),
                            &addr_key(&tx.from),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    registry.metrics.record_error("sender-resolve", e.to_string());
                }
            }
        });
    }

    /// Recompute the token price, always refreshing the cache, broadcasting
    /// only across the threshold. Calls within the coalescing window are
    /// dropped.
    pub async fn recompute_and_maybe_broadcast(&self, binding: &Arc<TokenBinding>) {
        let mut state = binding.state.lock().await;

        if let Some(last) = state.last_update_call {
            if last.elapsed() < self.coalesce_window {
                return;
            }
        }
        state.last_update_call = Some(Instant::now());

        let Some(price) = self
            .engine
            .compute_token_price(&binding.meta, &state.pools)
            .await
        else {
            return;
        };

        let old = state.last_price;
        self.engine.cache_price(price.clone());

        if self.engine.should_broadcast(old, price.price_usd) {
            state.last_price = price.price_usd;
            drop(state);
            self.metrics.inc_price_updates();
            self.fanout.broadcast_price_update(&price).await;
        }
    }
}
