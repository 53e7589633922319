//! Core types for the feed service.

use alloy::primitives::{Address, B256, I256, U256};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::errors::FeedError;

// ---------------------------------------------------------------------------
// Pool variants
// ---------------------------------------------------------------------------

/// The closed set of supported pool families. New families are added by
/// extending this enum and its `(load, decode, classify)` trio; nothing is
/// dispatched dynamically at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Constant-product pair, Uniswap V2 event shape.
    V2,
    /// Constant-product pair, Solidly-style event shape (Aerodrome).
    V2Alt,
    /// Concentrated liquidity, Uniswap V3 event and slot0 shape.
    V3,
    /// Concentrated liquidity, variant slot0 shapes (PancakeSwap V3, Slipstream).
    V3Alt,
}

impl PoolKind {
    pub fn is_v3(&self) -> bool {
        matches!(self, PoolKind::V3 | PoolKind::V3Alt)
    }

    /// The swap event topic this family's pools emit.
    pub fn swap_topic(&self) -> B256 {
        match self {
            PoolKind::V2 => constants::TOPIC_SWAP_V2,
            PoolKind::V2Alt => constants::TOPIC_SWAP_V2_ALT,
            PoolKind::V3 => constants::TOPIC_SWAP_V3,
            PoolKind::V3Alt => constants::TOPIC_SWAP_V3_ALT,
        }
    }
}

/// Protocol tags accepted on the dynamic-add and swap-listener surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    UniswapV2,
    UniswapV3,
    AerodromeV2,
    AerodromeV3,
    Slipstream,
}

impl Protocol {
    pub fn from_tag(tag: &str) -> Result<Self, FeedError> {
        match tag.to_ascii_lowercase().as_str() {
            "uniswapv2" => Ok(Protocol::UniswapV2),
            "uniswapv3" => Ok(Protocol::UniswapV3),
            "aerodromev2" => Ok(Protocol::AerodromeV2),
            "aerodromev3" => Ok(Protocol::AerodromeV3),
            "slipstream" => Ok(Protocol::Slipstream),
            other => Err(FeedError::UnknownProtocol(other.to_string())),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::UniswapV2 => "uniswapv2",
            Protocol::UniswapV3 => "uniswapv3",
            Protocol::AerodromeV2 => "aerodromev2",
            Protocol::AerodromeV3 => "aerodromev3",
            Protocol::Slipstream => "slipstream",
        }
    }

    pub fn kind(&self) -> PoolKind {
        match self {
            Protocol::UniswapV2 => PoolKind::V2,
            Protocol::UniswapV3 => PoolKind::V3,
            Protocol::AerodromeV2 => PoolKind::V2Alt,
            Protocol::AerodromeV3 | Protocol::Slipstream => PoolKind::V3Alt,
        }
    }
}

/// Parse and validate a hex address string.
pub fn parse_address(s: &str) -> Result<Address, FeedError> {
    s.trim()
        .parse::<Address>()
        .map_err(|_| FeedError::InvalidAddress(s.to_string()))
}

// ---------------------------------------------------------------------------
// Pair side
// ---------------------------------------------------------------------------

/// The numeraire on the non-monitored side of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pair {
    Wbnb,
    Usdt,
    Usdc,
    Busd,
    Dai,
    /// A token priced through the agent-token registry.
    Agent(Address),
}

impl Pair {
    /// Resolve a configured pair tag. Agent pairs require an address.
    pub fn from_spec(tag: &str, pair_address: Option<Address>) -> Result<Self, FeedError> {
        match tag.to_ascii_uppercase().as_str() {
            "WBNB" | "BNB" => Ok(Pair::Wbnb),
            "USDT" => Ok(Pair::Usdt),
            "USDC" => Ok(Pair::Usdc),
            "BUSD" => Ok(Pair::Busd),
            "DAI" => Ok(Pair::Dai),
            "AGENT" => pair_address
                .map(Pair::Agent)
                .ok_or_else(|| FeedError::UnknownPair("agent pair without pairAddress".into())),
            other => Err(FeedError::UnknownPair(other.to_string())),
        }
    }

    pub fn address(&self) -> Address {
        match self {
            Pair::Wbnb => constants::WBNB,
            Pair::Usdt => constants::USDT,
            Pair::Usdc => constants::USDC,
            Pair::Busd => constants::BUSD,
            Pair::Dai => constants::DAI,
            Pair::Agent(addr) => *addr,
        }
    }

    pub fn is_usd_stable(&self) -> bool {
        matches!(self, Pair::Usdt | Pair::Usdc | Pair::Busd | Pair::Dai)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Pair::Wbnb => "WBNB",
            Pair::Usdt => "USDT",
            Pair::Usdc => "USDC",
            Pair::Busd => "BUSD",
            Pair::Dai => "DAI",
            Pair::Agent(_) => "AGENT",
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime pool state
// ---------------------------------------------------------------------------

/// A loaded pool bound to one monitored token.
///
/// Identity is immutable after load; `reserve0/reserve1` (V2 families) and
/// `sqrt_price_x96` (V3 families) are the only fields swap handlers mutate.
#[derive(Debug, Clone)]
pub struct Pool {
    pub address: Address,
    pub kind: PoolKind,
    pub token0: Address,
    pub token1: Address,
    pub decimals0: u8,
    pub decimals1: u8,
    pub fee: u32,
    pub tick_spacing: i32,
    /// Whether the monitored token is `token0`.
    pub is_token0: bool,
    pub reserve0: U256,
    pub reserve1: U256,
    pub sqrt_price_x96: U256,
    pub liquidity: U256,
    pub pair: Pair,
    pub priority: u32,
}

impl Pool {
    pub fn has_liquidity(&self) -> bool {
        if self.kind.is_v3() {
            self.liquidity > U256::ZERO
        } else {
            self.reserve0 > U256::ZERO && self.reserve1 > U256::ZERO
        }
    }

    /// Decimals of the monitored token side.
    pub fn token_decimals(&self) -> u8 {
        if self.is_token0 {
            self.decimals0
        } else {
            self.decimals1
        }
    }

    /// Decimals of the pair side.
    pub fn pair_decimals(&self) -> u8 {
        if self.is_token0 {
            self.decimals1
        } else {
            self.decimals0
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded swap logs
// ---------------------------------------------------------------------------

/// A raw log delivered by the chain subscription.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub tx_hash: B256,
    pub block_number: Option<u64>,
}

/// A swap log payload decoded per pool family.
#[derive(Debug, Clone)]
pub enum SwapLog {
    V2 {
        sender: Address,
        to: Address,
        amount0_in: U256,
        amount1_in: U256,
        amount0_out: U256,
        amount1_out: U256,
    },
    V3 {
        sender: Address,
        recipient: Address,
        amount0: I256,
        amount1: I256,
        sqrt_price_x96: U256,
        liquidity: U256,
        tick: i32,
    },
}

// ---------------------------------------------------------------------------
// Configuration-facing specs
// ---------------------------------------------------------------------------

fn default_priority() -> u32 {
    1
}

fn default_decimals() -> u8 {
    constants::DEFAULT_DECIMALS
}

/// A statically configured (or dynamically built) token binding config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub symbol: String,
    pub name: String,
    /// Fallback decimals when the token contract refuses `decimals()`.
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    pub pools: Vec<PoolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub address: String,
    pub protocol: String,
    pub pair: String,
    /// Required when `pair` is `AGENT`.
    #[serde(default)]
    pub pair_address: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub fee: Option<u32>,
}

/// Payload for `addDynamicTokens`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicTokenSpec {
    pub token_address: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub pool_address: String,
    pub protocol: String,
    pub pair_type: String,
    #[serde(default)]
    pub pair_address: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub fee: Option<u32>,
}

/// Per-spec outcome of an `addDynamicTokens` batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub token_address: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<TokenPrice>,
}

/// Payload for `startSwapListener`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapListenerSpec {
    pub token_address: String,
    pub pool_address: String,
    pub protocol: String,
    pub pair_type: String,
    #[serde(default)]
    pub user_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Price outputs
// ---------------------------------------------------------------------------

/// One pool's contribution to a token price. Transient.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "priceBNB")]
    pub price_bnb: f64,
    pub pool_address: String,
    pub description: String,
    pub pair: String,
    pub priority: u32,
}

/// The cached, externally visible price of a monitored token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPrice {
    pub token_address: String,
    pub symbol: String,
    pub name: String,
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "priceBNB")]
    pub price_bnb: f64,
    pub pool_count: usize,
    pub pools: Vec<PriceSample>,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Mempool tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapOperation {
    Buy,
    Sell,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SwapStatus {
    Pending,
    Confirmed,
    Failed,
    Replaced,
    TimedOut,
}

/// A pending swap matched in the mempool, tracked to a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSwap {
    pub tx_hash: String,
    pub token_address: String,
    pub pool_address: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
    pub operation: SwapOperation,
    pub method_id: String,
    /// Detection wall-clock in milliseconds.
    pub detected_at: i64,
    pub status: SwapStatus,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_protocol_tags_round_trip() {
        for tag in ["uniswapv2", "uniswapv3", "aerodromev2", "aerodromev3", "slipstream"] {
            let p = Protocol::from_tag(tag).unwrap();
            assert_eq!(p.tag(), tag);
        }
        assert!(Protocol::from_tag("sushiswap").is_err());
    }

    #[test]
    fn test_protocol_kind_mapping() {
        assert_eq!(Protocol::UniswapV2.kind(), PoolKind::V2);
        assert_eq!(Protocol::AerodromeV2.kind(), PoolKind::V2Alt);
        assert_eq!(Protocol::UniswapV3.kind(), PoolKind::V3);
        assert_eq!(Protocol::AerodromeV3.kind(), PoolKind::V3Alt);
        assert_eq!(Protocol::Slipstream.kind(), PoolKind::V3Alt);
    }

    #[test]
    fn test_pair_from_spec() {
        assert_eq!(Pair::from_spec("WBNB", None).unwrap(), Pair::Wbnb);
        assert_eq!(Pair::from_spec("usdt", None).unwrap(), Pair::Usdt);

        let agent_addr = Address::repeat_byte(0x42);
        assert_eq!(
            Pair::from_spec("AGENT", Some(agent_addr)).unwrap(),
            Pair::Agent(agent_addr)
        );
        assert!(Pair::from_spec("AGENT", None).is_err());
        assert!(Pair::from_spec("DOGE", None).is_err());
    }

    #[test]
    fn test_has_liquidity_v2() {
        let mut pool = test_pool(PoolKind::V2);
        assert!(!pool.has_liquidity());
        pool.reserve0 = U256::from(1u64);
        pool.reserve1 = U256::from(1u64);
        assert!(pool.has_liquidity());
        pool.reserve1 = U256::ZERO;
        assert!(!pool.has_liquidity());
    }

    #[test]
    fn test_has_liquidity_v3() {
        let mut pool = test_pool(PoolKind::V3);
        assert!(!pool.has_liquidity());
        pool.liquidity = U256::from(10u64);
        assert!(pool.has_liquidity());
    }

    #[test]
    fn test_swap_status_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&SwapStatus::TimedOut).unwrap(),
            "\"timedOut\""
        );
        assert_eq!(
            serde_json::to_string(&SwapOperation::Buy).unwrap(),
            "\"buy\""
        );
    }

    pub(crate) fn test_pool(kind: PoolKind) -> Pool {
        Pool {
            address: Address::repeat_byte(0x01),
            kind,
            token0: Address::repeat_byte(0x02),
            token1: Address::repeat_byte(0x03),
            decimals0: 18,
            decimals1: 18,
            fee: 0,
            tick_spacing: 0,
            is_token0: true,
            reserve0: U256::ZERO,
            reserve1: U256::ZERO,
            sqrt_price_x96: U256::ZERO,
            liquidity: U256::ZERO,
            pair: Pair::Wbnb,
            priority: 1,
        }
    }
}
