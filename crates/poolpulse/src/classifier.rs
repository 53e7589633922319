//! Swap classification: direction and human-readable amounts.
//!
//! `is_buy` means the outside party received the monitored token from the
//! pool. V2 infers this from which output side is non-zero; V3 from the sign
//! of the monitored-side amount (negative = leaving the pool).

use std::str::FromStr;

use alloy::primitives::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::{Pool, SwapLog};

#[derive(Debug, Clone)]
pub struct SwapInfo {
    pub is_buy: bool,
    /// Monitored-token amount in human units.
    pub token_amount: f64,
    /// Pair-side amount in human units.
    pub pair_amount: f64,
    pub token_display: String,
    pub pair_display: String,
}

/// Classify a decoded swap log against the pool's token assignment.
pub fn classify(pool: &Pool, log: &SwapLog) -> SwapInfo {
    let (is_buy, token_raw, pair_raw) = match log {
        SwapLog::V2 {
            amount0_in,
            amount1_in,
            amount0_out,
            amount1_out,
            ..
        } => {
            if pool.is_token0 {
                if *amount0_out > U256::ZERO {
                    (true, *amount0_out, *amount1_in)
                } else {
                    (false, *amount0_in, *amount1_out)
                }
            } else if *amount1_out > U256::ZERO {
                (true, *amount1_out, *amount0_in)
            } else {
                (false, *amount1_in, *amount0_out)
            }
        }
        SwapLog::V3 {
            amount0, amount1, ..
        } => {
            let (monitored, other) = if pool.is_token0 {
                (amount0, amount1)
            } else {
                (amount1, amount0)
            };
            (
                monitored.is_negative(),
                monitored.unsigned_abs(),
                other.unsigned_abs(),
            )
        }
    };

    let token_amount = raw_to_human(token_raw, pool.token_decimals());
    let pair_amount = raw_to_human(pair_raw, pool.pair_decimals());

    SwapInfo {
        is_buy,
        token_amount,
        pair_amount,
        token_display: format_amount(token_amount),
        pair_display: format_amount(pair_amount),
    }
}

/// Scale a raw base-unit amount down by `10^decimals`.
///
/// Goes through `Decimal` for an exact scale shift when the value fits its
/// 96-bit mantissa, falling back to f64 for amounts beyond that range.
pub fn raw_to_human(raw: U256, decimals: u8) -> f64 {
    let s = raw.to_string();
    if let Ok(mut d) = Decimal::from_str(&s) {
        if d.set_scale(decimals as u32).is_ok() {
            if let Some(v) = d.to_f64() {
                return v;
            }
        }
    }
    s.parse::<f64>().unwrap_or(0.0) / 10f64.powi(decimals as i32)
}

/// Display rule: `< 0.01` scientific with 4 significant digits, `< 1000`
/// 4-decimal fixed, otherwise thousands-grouped with 2 decimals.
pub fn format_amount(value: f64) -> String {
    if value == 0.0 {
        return "0.0000".to_string();
    }
    if value < 0.01 {
        return format!("{value:.3e}");
    }
    if value < 1000.0 {
        return format!("{value:.4}");
    }
    group_thousands(value)
}

fn group_thousands(value: f64) -> String {
    let fixed = format!("{value:.2}");
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    format!("{grouped}.{frac_part}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, I256};
    use crate::types::{Pair, PoolKind};

    fn pool(is_token0: bool, decimals0: u8, decimals1: u8, kind: PoolKind) -> Pool {
        Pool {
            address: Address::repeat_byte(0x01),
            kind,
            token0: Address::repeat_byte(0x02),
            token1: Address::repeat_byte(0x03),
            decimals0,
            decimals1,
            fee: 0,
            tick_spacing: 0,
            is_token0,
            reserve0: U256::ZERO,
            reserve1: U256::ZERO,
            sqrt_price_x96: U256::ZERO,
            liquidity: U256::ZERO,
            pair: Pair::Wbnb,
            priority: 1,
        }
    }

    fn e18(units: u64) -> U256 {
        U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[test]
    fn test_v2_buy_monitored_token0() {
        // 10 tokens out of the pool for 0.1 WBNB in.
        let log = SwapLog::V2 {
            sender: Address::repeat_byte(0x04),
            to: Address::repeat_byte(0x05),
            amount0_in: U256::ZERO,
            amount1_in: e18(1) / U256::from(10u64),
            amount0_out: e18(10),
            amount1_out: U256::ZERO,
        };
        let info = classify(&pool(true, 18, 18, PoolKind::V2), &log);
        assert!(info.is_buy);
        assert_eq!(info.token_amount, 10.0);
        assert_eq!(info.pair_amount, 0.1);
        assert_eq!(info.token_display, "10.0000");
        assert_eq!(info.pair_display, "0.1000");
    }

    #[test]
    fn test_v2_sell_monitored_token0() {
        let log = SwapLog::V2 {
            sender: Address::repeat_byte(0x04),
            to: Address::repeat_byte(0x05),
            amount0_in: e18(5),
            amount1_in: U256::ZERO,
            amount0_out: U256::ZERO,
            amount1_out: e18(1) / U256::from(20u64),
        };
        let info = classify(&pool(true, 18, 18, PoolKind::V2), &log);
        assert!(!info.is_buy);
        assert_eq!(info.token_amount, 5.0);
        assert_eq!(info.pair_amount, 0.05);
    }

    #[test]
    fn test_v2_buy_monitored_token1() {
        let log = SwapLog::V2 {
            sender: Address::repeat_byte(0x04),
            to: Address::repeat_byte(0x05),
            amount0_in: e18(2),
            amount1_in: U256::ZERO,
            amount0_out: U256::ZERO,
            amount1_out: e18(300),
        };
        let info = classify(&pool(false, 18, 18, PoolKind::V2), &log);
        assert!(info.is_buy);
        assert_eq!(info.token_amount, 300.0);
        assert_eq!(info.pair_amount, 2.0);
    }

    #[test]
    fn test_v3_buy_monitored_token1_negative_amount() {
        // Monitored-side (token1) amount is negative, so tokens left the
        // pool toward the trader: a buy.
        let log = SwapLog::V3 {
            sender: Address::repeat_byte(0x04),
            recipient: Address::repeat_byte(0x05),
            amount0: I256::try_from(1_000_000i64).unwrap(),
            amount1: I256::try_from(-1_000_000_000_000_000_000i128).unwrap(),
            sqrt_price_x96: U256::from(1u64) << 96,
            liquidity: U256::from(1u64),
            tick: 0,
        };
        let info = classify(&pool(false, 6, 18, PoolKind::V3), &log);
        assert!(info.is_buy);
        assert_eq!(info.token_amount, 1.0);
        assert_eq!(info.pair_amount, 1.0);
    }

    #[test]
    fn test_v3_sell_monitored_token0() {
        let log = SwapLog::V3 {
            sender: Address::repeat_byte(0x04),
            recipient: Address::repeat_byte(0x05),
            amount0: I256::try_from(2_000_000_000_000_000_000i128).unwrap(),
            amount1: I256::try_from(-4_000_000i64).unwrap(),
            sqrt_price_x96: U256::from(1u64) << 96,
            liquidity: U256::from(1u64),
            tick: 0,
        };
        let info = classify(&pool(true, 18, 6, PoolKind::V3), &log);
        assert!(!info.is_buy);
        assert_eq!(info.token_amount, 2.0);
        assert_eq!(info.pair_amount, 4.0);
    }

    #[test]
    fn test_format_amount_rules() {
        assert_eq!(format_amount(0.0), "0.0000");
        assert_eq!(format_amount(0.000123), "1.230e-4");
        assert_eq!(format_amount(0.5), "0.5000");
        assert_eq!(format_amount(999.99), "999.9900");
        assert_eq!(format_amount(1234.5), "1,234.50");
        assert_eq!(format_amount(1_234_567.891), "1,234,567.89");
    }

    #[test]
    fn test_raw_to_human_is_exact_within_decimal_range() {
        use rust_decimal_macros::dec;

        let raw = U256::from(123_456_789_012_345_678u128);
        let expected = dec!(0.123456789012345678).to_f64().unwrap();
        assert_eq!(raw_to_human(raw, 18), expected);

        let raw = U256::from(1_500_000u64);
        assert_eq!(raw_to_human(raw, 6), 1.5);
    }

    #[test]
    fn test_raw_to_human_large_value_falls_back() {
        // 10^40 overflows Decimal's mantissa but still formats via f64.
        let huge = U256::from(10u64).pow(U256::from(40u64));
        let v = raw_to_human(huge, 18);
        assert!((v - 1e22).abs() / 1e22 < 1e-9);
    }
}
