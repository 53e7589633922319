//! Pool loading and swap-log decoding.
//!
//! Dispatches to the family-specific module based on `PoolKind`. Each family
//! implements the same trio: load on-chain metadata, refresh mutable state,
//! decode a swap log payload.

pub mod decimals;
pub mod v2;
pub mod v3;

use alloy::primitives::Address;

use crate::chain::ChainClient;
use crate::constants::addr_key;
use crate::errors::{FeedError, Result};
use crate::types::{LogEvent, Pair, Pool, PoolKind, SwapLog};

use decimals::DecimalsCache;

/// Load a pool's immutable metadata and current state, validating that the
/// monitored token is one of its two sides.
pub async fn load_pool(
    chain: &ChainClient,
    decimals_cache: &DecimalsCache,
    address: Address,
    kind: PoolKind,
    monitored: Address,
    pair: Pair,
    priority: u32,
) -> Result<Pool> {
    let mut pool = if kind.is_v3() {
        v3::load(chain, address, kind).await?
    } else {
        v2::load(chain, address, kind).await?
    };

    pool.is_token0 = if monitored == pool.token0 {
        true
    } else if monitored == pool.token1 {
        false
    } else {
        return Err(FeedError::TokenNotInPool {
            token: addr_key(&monitored),
            pool: addr_key(&address),
        });
    };

    pool.decimals0 = decimals_cache.resolve(chain, pool.token0).await;
    pool.decimals1 = decimals_cache.resolve(chain, pool.token1).await;
    pool.pair = pair;
    pool.priority = priority;

    Ok(pool)
}

/// Refresh the mutable price state of an already loaded pool.
pub async fn refresh_state(chain: &ChainClient, pool: &mut Pool) -> Result<()> {
    if pool.kind.is_v3() {
        v3::refresh(chain, pool).await
    } else {
        v2::refresh(chain, pool).await
    }
}

/// Decode a swap log delivered for a pool of the given family.
pub fn decode_swap_log(kind: PoolKind, event: &LogEvent) -> Result<SwapLog> {
    match kind {
        PoolKind::V2 | PoolKind::V2Alt => v2::decode_swap(event),
        PoolKind::V3 | PoolKind::V3Alt => v3::decode_swap(event),
    }
}
