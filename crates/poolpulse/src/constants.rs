//! Chain addresses, event topics, and method selectors for BSC mainnet.

use alloy::primitives::{address, b256, Address, B256};

// ---------------------------------------------------------------------------
// Token addresses (BSC mainnet)
// ---------------------------------------------------------------------------

pub const WBNB: Address = address!("bb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c");
pub const USDT: Address = address!("55d398326f99059fF775485246999027B3197955");
pub const USDC: Address = address!("8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d");
pub const BUSD: Address = address!("e9e7CEA3DedcA5984780Bafc599bD69ADd087D56");
pub const DAI: Address = address!("1AF3F329e8BE154074D8769D1FFa4eE058B1DBc3");

pub const STABLES: [Address; 4] = [USDT, USDC, BUSD, DAI];

/// Tokens whose `decimals()` never changes; skipping the RPC for these.
/// Everything in this table is an 18-decimal BSC contract.
pub const KNOWN_DECIMALS: [(Address, u8); 5] = [
    (WBNB, 18),
    (USDT, 18),
    (USDC, 18),
    (BUSD, 18),
    (DAI, 18),
];

/// Fallback when a token contract refuses the `decimals()` call.
pub const DEFAULT_DECIMALS: u8 = 18;

// ---------------------------------------------------------------------------
// BNB/USD reference pools (PancakeSwap V3 WBNB/USDT)
// ---------------------------------------------------------------------------

/// Default V3 pools the BNB/USD reference is derived from. Overridable via
/// the JSON config overlay.
pub const BNB_REFERENCE_POOLS: [Address; 2] = [
    address!("36696169C63e42cd08ce11f5deeBbCeBae652050"),
    address!("172fcD41E0913e95784454622d1c3724f546f849"),
];

// ---------------------------------------------------------------------------
// View-call selectors (zero-argument; calldata is the bare selector)
// ---------------------------------------------------------------------------

pub const SEL_TOKEN0: [u8; 4] = [0x0d, 0xfe, 0x16, 0x81];
pub const SEL_TOKEN1: [u8; 4] = [0xd2, 0x12, 0x20, 0xa7];
pub const SEL_GET_RESERVES: [u8; 4] = [0x09, 0x02, 0xf1, 0xac];
pub const SEL_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
pub const SEL_FEE: [u8; 4] = [0xdd, 0xca, 0x3f, 0x43];
pub const SEL_LIQUIDITY: [u8; 4] = [0x1a, 0x68, 0x65, 0x02];
pub const SEL_SLOT0: [u8; 4] = [0x38, 0x50, 0xc7, 0xbd];
pub const SEL_TICK_SPACING: [u8; 4] = [0xd0, 0xc9, 0x3a, 0x7c];

// ---------------------------------------------------------------------------
// Swap function selectors watched in the mempool
// ---------------------------------------------------------------------------

// Pool-direct calls.
pub const SEL_V2_POOL_SWAP: [u8; 4] = [0x02, 0x2c, 0x0d, 0x9f];
pub const SEL_V3_POOL_SWAP: [u8; 4] = [0x12, 0x8a, 0xcb, 0x08];

// V2 router selectors.
pub const SEL_SWAP_EXACT_ETH_FOR_TOKENS: [u8; 4] = [0x7f, 0xf3, 0x6a, 0xb5];
pub const SEL_SWAP_EXACT_TOKENS_FOR_ETH: [u8; 4] = [0x18, 0xcb, 0xaf, 0xe5];
pub const SEL_SWAP_EXACT_TOKENS_FOR_TOKENS: [u8; 4] = [0x38, 0xed, 0x17, 0x39];
pub const SEL_SWAP_TOKENS_FOR_EXACT_TOKENS: [u8; 4] = [0x88, 0x03, 0xdb, 0xee];
pub const SEL_SWAP_EXACT_ETH_FOR_TOKENS_FEE: [u8; 4] = [0xb6, 0xf9, 0xde, 0x95];
pub const SEL_SWAP_ETH_FOR_EXACT_TOKENS: [u8; 4] = [0xfb, 0x3b, 0xdb, 0x41];
pub const SEL_SWAP_EXACT_TOKENS_FOR_TOKENS_FEE: [u8; 4] = [0x5c, 0x11, 0xd7, 0x95];
pub const SEL_SWAP_EXACT_TOKENS_FOR_ETH_FEE: [u8; 4] = [0x79, 0x1a, 0xc9, 0x47];
pub const SEL_SWAP_TOKENS_FOR_EXACT_ETH: [u8; 4] = [0x4a, 0x25, 0xd9, 0x4a];

// V3 router selectors.
pub const SEL_EXACT_INPUT_SINGLE: [u8; 4] = [0x41, 0x4b, 0xf3, 0x89];
pub const SEL_EXACT_INPUT: [u8; 4] = [0xc0, 0x4b, 0x8d, 0x59];
pub const SEL_EXACT_OUTPUT_SINGLE: [u8; 4] = [0xdb, 0x3e, 0x21, 0x98];
pub const SEL_EXACT_OUTPUT: [u8; 4] = [0xf2, 0x8c, 0x04, 0x98];

/// V2-style router selectors (direction unknown until the log arrives).
pub const V2_ROUTER_SELECTORS: [[u8; 4]; 9] = [
    SEL_SWAP_EXACT_ETH_FOR_TOKENS,
    SEL_SWAP_EXACT_TOKENS_FOR_ETH,
    SEL_SWAP_EXACT_TOKENS_FOR_TOKENS,
    SEL_SWAP_TOKENS_FOR_EXACT_TOKENS,
    SEL_SWAP_EXACT_ETH_FOR_TOKENS_FEE,
    SEL_SWAP_ETH_FOR_EXACT_TOKENS,
    SEL_SWAP_EXACT_TOKENS_FOR_TOKENS_FEE,
    SEL_SWAP_EXACT_TOKENS_FOR_ETH_FEE,
    SEL_SWAP_TOKENS_FOR_EXACT_ETH,
];

/// V3-style router selectors (direction unknown until the log arrives).
pub const V3_ROUTER_SELECTORS: [[u8; 4]; 4] = [
    SEL_EXACT_INPUT_SINGLE,
    SEL_EXACT_INPUT,
    SEL_EXACT_OUTPUT_SINGLE,
    SEL_EXACT_OUTPUT,
];

// ---------------------------------------------------------------------------
// Swap event topics
// ---------------------------------------------------------------------------

/// Uniswap/PancakeSwap V2: Swap(address,uint256,uint256,uint256,uint256,address)
pub const TOPIC_SWAP_V2: B256 =
    b256!("d78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822");

/// Solidly-style V2 (Aerodrome): Swap(address,address,uint256,uint256,uint256,uint256)
pub const TOPIC_SWAP_V2_ALT: B256 =
    b256!("b3e2773606abfd36b5bd91394b3a54d1398336c65005baf7bf7a05efeffaf75b");

/// Uniswap V3 / Slipstream: Swap(address,address,int256,int256,uint160,uint128,int24)
pub const TOPIC_SWAP_V3: B256 =
    b256!("c42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67");

/// PancakeSwap V3: same head layout with two trailing protocol-fee words.
pub const TOPIC_SWAP_V3_ALT: B256 =
    b256!("19b47279256b2a23a1665c810c8d55a1758940ee09377d4f8d26497a3577dc83");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercase-hex form of an address, the canonical key for every
/// address-keyed map in the service.
pub fn addr_key(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

/// Lowercase-normalize a user-supplied address string.
pub fn normalize_addr(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

pub fn is_stable(addr: &Address) -> bool {
    STABLES.contains(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_key_is_lowercase() {
        let key = addr_key(&WBNB);
        assert!(key.starts_with("0x"));
        assert_eq!(key, key.to_ascii_lowercase());
        assert_eq!(key.len(), 42);
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(
            normalize_addr(" 0xBB4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c"),
            "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c"
        );
    }

    #[test]
    fn test_stable_membership() {
        assert!(is_stable(&USDT));
        assert!(is_stable(&DAI));
        assert!(!is_stable(&WBNB));
    }
}
