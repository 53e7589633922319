//! Per-address token decimals cache.
//!
//! Known-stable addresses resolve from a constant table; everything else
//! calls `decimals()` once and caches the answer. A failed read logs a
//! warning and falls back to 18.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::Address;
use tracing::{debug, warn};

use crate::abi;
use crate::chain::ChainClient;
use crate::constants::{self, addr_key};

pub struct DecimalsCache {
    cache: Mutex<HashMap<Address, u8>>,
}

impl DecimalsCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, chain: &ChainClient, token: Address) -> u8 {
        if let Some((_, d)) = constants::KNOWN_DECIMALS.iter().find(|(a, _)| *a == token) {
            return *d;
        }

        if let Some(d) = self.cache.lock().expect("decimals cache poisoned").get(&token) {
            return *d;
        }

        let decimals = match self.fetch(chain, token).await {
            Some(d) => d,
            None => {
                warn!(
                    token = %addr_key(&token),
                    fallback = constants::DEFAULT_DECIMALS,
                    "decimals() read failed, using fallback"
                );
                constants::DEFAULT_DECIMALS
            }
        };

        self.cache
            .lock()
            .expect("decimals cache poisoned")
            .insert(token, decimals);
        decimals
    }

    async fn fetch(&self, chain: &ChainClient, token: Address) -> Option<u8> {
        let data = chain
            .call(token, abi::selector_call(constants::SEL_DECIMALS))
            .await
            .ok()?;
        let value = abi::word_u32(&data, 0)?;
        if value > u8::MAX as u32 {
            return None;
        }
        debug!(token = %addr_key(&token), decimals = value, "resolved token decimals");
        Some(value as u8)
    }

    /// Seed an entry directly (used for config-declared fallbacks).
    pub fn seed(&self, token: Address, decimals: u8) {
        self.cache
            .lock()
            .expect("decimals cache poisoned")
            .entry(token)
            .or_insert(decimals);
    }
}

impl Default for DecimalsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_does_not_overwrite() {
        let cache = DecimalsCache::new();
        let token = Address::repeat_byte(0x77);
        cache.seed(token, 9);
        cache.seed(token, 6);
        let map = cache.cache.lock().unwrap();
        assert_eq!(map.get(&token), Some(&9));
    }
}
