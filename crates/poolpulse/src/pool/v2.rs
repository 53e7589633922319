//! Constant-product (V2 family) pool loading and swap-log decoding.
//!
//! Covers the Uniswap V2 event shape and the Solidly-style alternate shape
//! (Aerodrome). Both emit `(sender, to)` as indexed topics and four unsigned
//! amount words; only the event signature differs.

use alloy::primitives::{Address, U256};

use crate::abi;
use crate::chain::ChainClient;
use crate::constants::{self, addr_key};
use crate::errors::{FeedError, Result};
use crate::types::{LogEvent, Pair, Pool, PoolKind, SwapLog};

/// Load token0/token1 and current reserves.
pub async fn load(chain: &ChainClient, address: Address, kind: PoolKind) -> Result<Pool> {
    let token0 = read_address(chain, address, constants::SEL_TOKEN0, "token0").await?;
    let token1 = read_address(chain, address, constants::SEL_TOKEN1, "token1").await?;

    let mut pool = Pool {
        address,
        kind,
        token0,
        token1,
        decimals0: constants::DEFAULT_DECIMALS,
        decimals1: constants::DEFAULT_DECIMALS,
        fee: 0,
        tick_spacing: 0,
        is_token0: true,
        reserve0: U256::ZERO,
        reserve1: U256::ZERO,
        sqrt_price_x96: U256::ZERO,
        liquidity: U256::ZERO,
        pair: Pair::Wbnb,
        priority: 1,
    };
    refresh(chain, &mut pool).await?;
    Ok(pool)
}

/// Re-read `getReserves()`.
pub async fn refresh(chain: &ChainClient, pool: &mut Pool) -> Result<()> {
    let data = chain
        .call(pool.address, abi::selector_call(constants::SEL_GET_RESERVES))
        .await
        .map_err(|e| FeedError::PoolLoadFailed {
            pool: addr_key(&pool.address),
            reason: format!("getReserves: {e}"),
        })?;

    let reserve0 = abi::word_u256(&data, 0).ok_or_else(|| bad_reserves(&pool.address))?;
    let reserve1 = abi::word_u256(&data, 1).ok_or_else(|| bad_reserves(&pool.address))?;
    pool.reserve0 = reserve0;
    pool.reserve1 = reserve1;
    Ok(())
}

/// Decode the V2 swap payload:
/// topics `(sender, to)`, data `(amount0In, amount1In, amount0Out, amount1Out)`.
pub fn decode_swap(event: &LogEvent) -> Result<SwapLog> {
    if event.topics.len() < 3 {
        return Err(bad_swap(&event.address, "missing indexed topics"));
    }
    let sender = abi::topic_address(&event.topics[1]);
    let to = abi::topic_address(&event.topics[2]);

    let amount0_in =
        abi::word_u256(&event.data, 0).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let amount1_in =
        abi::word_u256(&event.data, 1).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let amount0_out =
        abi::word_u256(&event.data, 2).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let amount1_out =
        abi::word_u256(&event.data, 3).ok_or_else(|| bad_swap(&event.address, "short data"))?;

    Ok(SwapLog::V2 {
        sender,
        to,
        amount0_in,
        amount1_in,
        amount0_out,
        amount1_out,
    })
}

async fn read_address(
    chain: &ChainClient,
    pool: Address,
    selector: [u8; 4],
    label: &str,
) -> Result<Address> {
    let data = chain
        .call(pool, abi::selector_call(selector))
        .await
        .map_err(|e| FeedError::PoolLoadFailed {
            pool: addr_key(&pool),
            reason: format!("{label}: {e}"),
        })?;
    abi::word_address(&data, 0).ok_or_else(|| FeedError::PoolLoadFailed {
        pool: addr_key(&pool),
        reason: format!("{label}: short return data"),
    })
}

fn bad_reserves(pool: &Address) -> FeedError {
    FeedError::PoolLoadFailed {
        pool: addr_key(pool),
        reason: "getReserves: short return data".into(),
    }
}

fn bad_swap(pool: &Address, reason: &str) -> FeedError {
    FeedError::BadReturnData {
        call: format!("swap log {}", addr_key(pool)),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    pub(crate) fn v2_swap_event(
        pool: Address,
        sender: Address,
        to: Address,
        amounts: [U256; 4],
    ) -> LogEvent {
        let mut data = Vec::with_capacity(128);
        for a in amounts {
            data.extend_from_slice(&a.to_be_bytes::<32>());
        }
        let mut sender_topic = [0u8; 32];
        sender_topic[12..].copy_from_slice(sender.as_slice());
        let mut to_topic = [0u8; 32];
        to_topic[12..].copy_from_slice(to.as_slice());

        LogEvent {
            address: pool,
            topics: vec![
                crate::constants::TOPIC_SWAP_V2,
                B256::from(sender_topic),
                B256::from(to_topic),
            ],
            data,
            tx_hash: B256::repeat_byte(0xaa),
            block_number: Some(1),
        }
    }

    #[test]
    fn test_decode_swap() {
        let pool = Address::repeat_byte(0x01);
        let sender = Address::repeat_byte(0x02);
        let to = Address::repeat_byte(0x03);
        // 0.1e18 WBNB in, 10e18 tokens out.
        let event = v2_swap_event(
            pool,
            sender,
            to,
            [
                U256::ZERO,
                U256::from(100_000_000_000_000_000u128),
                U256::from(10_000_000_000_000_000_000u128),
                U256::ZERO,
            ],
        );

        match decode_swap(&event).unwrap() {
            SwapLog::V2 {
                sender: s,
                to: t,
                amount0_in,
                amount1_in,
                amount0_out,
                amount1_out,
            } => {
                assert_eq!(s, sender);
                assert_eq!(t, to);
                assert_eq!(amount0_in, U256::ZERO);
                assert_eq!(amount1_in, U256::from(100_000_000_000_000_000u128));
                assert_eq!(amount0_out, U256::from(10_000_000_000_000_000_000u128));
                assert_eq!(amount1_out, U256::ZERO);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_decode_swap_short_data() {
        let pool = Address::repeat_byte(0x01);
        let mut event = v2_swap_event(
            pool,
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
            [U256::ZERO; 4],
        );
        event.data.truncate(64);
        assert!(decode_swap(&event).is_err());
    }

    #[test]
    fn test_decode_swap_missing_topics() {
        let pool = Address::repeat_byte(0x01);
        let mut event = v2_swap_event(
            pool,
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
            [U256::ZERO; 4],
        );
        event.topics.truncate(1);
        assert!(decode_swap(&event).is_err());
    }
}
