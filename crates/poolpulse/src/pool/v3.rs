//! Concentrated-liquidity (V3 family) pool loading and swap-log decoding.
//!
//! The alternate family's `slot0()` return shape differs between deployments,
//! so decoding tries the standard 7-word tuple, then a 6-word variant, then a
//! raw slice of the first two words (uint160 sqrtPriceX96, int24 tick). The
//! first variant that decodes wins.

use alloy::primitives::{Address, U256};
use tracing::debug;

use crate::abi;
use crate::chain::ChainClient;
use crate::constants::{self, addr_key};
use crate::errors::{FeedError, Result};
use crate::types::{LogEvent, Pair, Pool, PoolKind, SwapLog};

/// Load token0/token1, fee, tickSpacing, liquidity, and slot0.
pub async fn load(chain: &ChainClient, address: Address, kind: PoolKind) -> Result<Pool> {
    let token0 = read_address(chain, address, constants::SEL_TOKEN0, "token0").await?;
    let token1 = read_address(chain, address, constants::SEL_TOKEN1, "token1").await?;

    // The alternate family does not always expose fee()/tickSpacing(); both
    // default rather than failing the load.
    let fee = read_u32(chain, address, constants::SEL_FEE).await.unwrap_or(0);
    let tick_spacing = read_i32(chain, address, constants::SEL_TICK_SPACING)
        .await
        .unwrap_or(0);

    let mut pool = Pool {
        address,
        kind,
        token0,
        token1,
        decimals0: constants::DEFAULT_DECIMALS,
        decimals1: constants::DEFAULT_DECIMALS,
        fee,
        tick_spacing,
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

/// Re-read `slot0()` and `liquidity()`.
pub async fn refresh(chain: &ChainClient, pool: &mut Pool) -> Result<()> {
    let slot0 = chain
        .call(pool.address, abi::selector_call(constants::SEL_SLOT0))
        .await
        .map_err(|e| FeedError::PoolLoadFailed {
            pool: addr_key(&pool.address),
            reason: format!("slot0: {e}"),
        })?;
    let (sqrt_price_x96, tick) = decode_slot0(&slot0).ok_or_else(|| FeedError::PoolLoadFailed {
        pool: addr_key(&pool.address),
        reason: format!("slot0: undecodable {}-byte return", slot0.len()),
    })?;

    let liquidity = chain
        .call(pool.address, abi::selector_call(constants::SEL_LIQUIDITY))
        .await
        .ok()
        .and_then(|data| abi::word_u256(&data, 0))
        .unwrap_or(U256::ZERO);

    debug!(
        pool = %addr_key(&pool.address),
        tick = tick,
        "refreshed V3 pool state"
    );
    pool.sqrt_price_x96 = sqrt_price_x96;
    pool.liquidity = liquidity;
    Ok(())
}

/// Decode `slot0()` return data into `(sqrtPriceX96, tick)`.
pub fn decode_slot0(data: &[u8]) -> Option<(U256, i32)> {
    try_slot0_standard(data)
        .or_else(|| try_slot0_narrow(data))
        .or_else(|| try_slot0_raw(data))
}

/// Standard 7-word tuple (Uniswap V3, PancakeSwap V3).
fn try_slot0_standard(data: &[u8]) -> Option<(U256, i32)> {
    if abi::word_count(data) != 7 {
        return None;
    }
    Some((abi::word_u256(data, 0)?, abi::word_i32(data, 1)?))
}

/// Narrower 6-word variant (Slipstream drops the fee-protocol slot).
fn try_slot0_narrow(data: &[u8]) -> Option<(U256, i32)> {
    if abi::word_count(data) != 6 {
        return None;
    }
    Some((abi::word_u256(data, 0)?, abi::word_i32(data, 1)?))
}

/// Last resort: first word unsigned, second word signed int24, whatever the
/// trailing shape is.
fn try_slot0_raw(data: &[u8]) -> Option<(U256, i32)> {
    if abi::word_count(data) < 2 {
        return None;
    }
    Some((abi::word_u256(data, 0)?, abi::word_i32(data, 1)?))
}

/// Decode the V3 swap payload:
/// topics `(sender, recipient)`, data
/// `(amount0, amount1, sqrtPriceX96, liquidity, tick[, protocol fees…])`.
/// Trailing protocol-fee words (PancakeSwap V3) are ignored.
pub fn decode_swap(event: &LogEvent) -> Result<SwapLog> {
    if event.topics.len() < 3 {
        return Err(bad_swap(&event.address, "missing indexed topics"));
    }
    let sender = abi::topic_address(&event.topics[1]);
    let recipient = abi::topic_address(&event.topics[2]);

    let amount0 =
        abi::word_i256(&event.data, 0).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let amount1 =
        abi::word_i256(&event.data, 1).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let sqrt_price_x96 =
        abi::word_u256(&event.data, 2).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let liquidity =
        abi::word_u256(&event.data, 3).ok_or_else(|| bad_swap(&event.address, "short data"))?;
    let tick =
        abi::word_i32(&event.data, 4).ok_or_else(|| bad_swap(&event.address, "short data"))?;

    Ok(SwapLog::V3 {
        sender,
        recipient,
        amount0,
        amount1,
        sqrt_price_x96,
        liquidity,
        tick,
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

async fn read_u32(chain: &ChainClient, pool: Address, selector: [u8; 4]) -> Option<u32> {
    let data = chain.call(pool, abi::selector_call(selector)).await.ok()?;
    abi::word_u32(&data, 0)
}

async fn read_i32(chain: &ChainClient, pool: Address, selector: [u8; 4]) -> Option<i32> {
    let data = chain.call(pool, abi::selector_call(selector)).await.ok()?;
    abi::word_i32(&data, 0)
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
    use alloy::primitives::{B256, I256};

    fn words(values: &[U256]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| v.to_be_bytes::<32>())
            .collect()
    }

    #[test]
    fn test_slot0_standard_seven_words() {
        let sqrt = U256::from(1u64) << 96;
        let mut data = words(&[sqrt]);
        data.extend_from_slice(&I256::try_from(-887272i64).unwrap().to_be_bytes::<32>());
        data.extend_from_slice(&words(&[U256::ZERO; 5]));
        assert_eq!(abi::word_count(&data), 7);

        let (price, tick) = decode_slot0(&data).unwrap();
        assert_eq!(price, sqrt);
        assert_eq!(tick, -887272);
    }

    #[test]
    fn test_slot0_narrow_six_words() {
        let sqrt = U256::from(12345u64);
        let mut data = words(&[sqrt, U256::from(7u64)]);
        data.extend_from_slice(&words(&[U256::ZERO; 4]));
        assert_eq!(abi::word_count(&data), 6);

        let (price, tick) = decode_slot0(&data).unwrap();
        assert_eq!(price, sqrt);
        assert_eq!(tick, 7);
    }

    #[test]
    fn test_slot0_raw_two_words() {
        let sqrt = U256::from(999u64);
        let data = words(&[sqrt, U256::from(3u64)]);
        let (price, tick) = decode_slot0(&data).unwrap();
        assert_eq!(price, sqrt);
        assert_eq!(tick, 3);
    }

    #[test]
    fn test_slot0_too_short() {
        assert!(decode_slot0(&words(&[U256::ZERO])).is_none());
        assert!(decode_slot0(&[]).is_none());
    }

    pub(crate) fn v3_swap_event(
        pool: Address,
        sender: Address,
        recipient: Address,
        amount0: I256,
        amount1: I256,
        sqrt_price_x96: U256,
    ) -> LogEvent {
        let mut data = Vec::with_capacity(160);
        data.extend_from_slice(&amount0.to_be_bytes::<32>());
        data.extend_from_slice(&amount1.to_be_bytes::<32>());
        data.extend_from_slice(&sqrt_price_x96.to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(1_000_000u64).to_be_bytes::<32>());
        data.extend_from_slice(&I256::ZERO.to_be_bytes::<32>());

        let mut sender_topic = [0u8; 32];
        sender_topic[12..].copy_from_slice(sender.as_slice());
        let mut recipient_topic = [0u8; 32];
        recipient_topic[12..].copy_from_slice(recipient.as_slice());

        LogEvent {
            address: pool,
            topics: vec![
                crate::constants::TOPIC_SWAP_V3,
                B256::from(sender_topic),
                B256::from(recipient_topic),
            ],
            data,
            tx_hash: B256::repeat_byte(0xbb),
            block_number: Some(2),
        }
    }

    #[test]
    fn test_decode_swap_signed_amounts() {
        let pool = Address::repeat_byte(0x01);
        let event = v3_swap_event(
            pool,
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
            I256::try_from(1_000_000i64).unwrap(),
            I256::try_from(-1_000_000_000_000_000_000i128).unwrap(),
            U256::from(1u64) << 96,
        );

        match decode_swap(&event).unwrap() {
            SwapLog::V3 {
                amount0,
                amount1,
                sqrt_price_x96,
                liquidity,
                ..
            } => {
                assert_eq!(amount0, I256::try_from(1_000_000i64).unwrap());
                assert!(amount1.is_negative());
                assert_eq!(sqrt_price_x96, U256::from(1u64) << 96);
                assert_eq!(liquidity, U256::from(1_000_000u64));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_decode_swap_tolerates_trailing_fee_words() {
        let pool = Address::repeat_byte(0x01);
        let mut event = v3_swap_event(
            pool,
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
            I256::ONE,
            I256::MINUS_ONE,
            U256::from(1u64) << 96,
        );
        // PancakeSwap V3 appends two protocol-fee words.
        event.data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
        event.data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
        assert!(decode_swap(&event).is_ok());
    }
}
