//! 32-byte-word helpers for `eth_call` return data and event payloads.
//!
//! Pool families disagree on return shapes (`slot0` in particular), so the
//! decoders work at word granularity: fixed-size heads only, no dynamic
//! offsets. Calldata with parameters goes through `alloy::sol!` structs
//! instead (see `mempool`).

use alloy::primitives::{Address, B256, I256, U256};

pub const WORD: usize = 32;

/// The `index`-th 32-byte word of `data`, if present.
pub fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * WORD;
    data.get(start..start + WORD)
}

/// Number of complete words in `data`.
pub fn word_count(data: &[u8]) -> usize {
    data.len() / WORD
}

pub fn word_u256(data: &[u8], index: usize) -> Option<U256> {
    word(data, index).map(U256::from_be_slice)
}

/// Signed 256-bit word (two's complement), as emitted by V3 swap events.
pub fn word_i256(data: &[u8], index: usize) -> Option<I256> {
    word(data, index).map(|w| I256::from_raw(U256::from_be_slice(w)))
}

/// Address from the low 20 bytes of a word.
pub fn word_address(data: &[u8], index: usize) -> Option<Address> {
    word(data, index).map(|w| Address::from_slice(&w[12..]))
}

/// Small unsigned integer (decimals, fee tiers) from the low bytes of a word.
pub fn word_u32(data: &[u8], index: usize) -> Option<u32> {
    let w = word(data, index)?;
    Some(u32::from_be_bytes([w[28], w[29], w[30], w[31]]))
}

/// Sign-extended small integer (int24 tick, tickSpacing) from a full word.
pub fn word_i32(data: &[u8], index: usize) -> Option<i32> {
    let value = word_i256(data, index)?;
    value.try_into().ok()
}

/// An indexed event topic holding an address.
pub fn topic_address(topic: &B256) -> Address {
    Address::from_slice(&topic.as_slice()[12..])
}

/// Calldata for a zero-argument view call.
pub fn selector_call(selector: [u8; 4]) -> Vec<u8> {
    selector.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_words(words: &[[u8; 32]]) -> Vec<u8> {
        words.iter().flatten().copied().collect()
    }

    fn u256_word(value: u64) -> [u8; 32] {
        U256::from(value).to_be_bytes::<32>()
    }

    #[test]
    fn test_word_u256() {
        let data = encode_words(&[u256_word(42), u256_word(7)]);
        assert_eq!(word_u256(&data, 0), Some(U256::from(42)));
        assert_eq!(word_u256(&data, 1), Some(U256::from(7)));
        assert_eq!(word_u256(&data, 2), None);
    }

    #[test]
    fn test_word_i256_negative() {
        // -1 is all 0xff.
        let data = [0xffu8; 32].to_vec();
        assert_eq!(word_i256(&data, 0), Some(I256::MINUS_ONE));
    }

    #[test]
    fn test_word_i32_sign_extension() {
        // int24 -60 sign-extended to a full word.
        let minus_sixty = I256::try_from(-60i64).unwrap();
        let data = minus_sixty.to_be_bytes::<32>().to_vec();
        assert_eq!(word_i32(&data, 0), Some(-60));
    }

    #[test]
    fn test_word_address() {
        let addr = Address::repeat_byte(0xab);
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(addr.as_slice());
        let data = w.to_vec();
        assert_eq!(word_address(&data, 0), Some(addr));
    }

    #[test]
    fn test_word_u32() {
        let data = u256_word(2500).to_vec();
        assert_eq!(word_u32(&data, 0), Some(2500));
    }

    #[test]
    fn test_topic_address() {
        let addr = Address::repeat_byte(0x11);
        let mut t = [0u8; 32];
        t[12..].copy_from_slice(addr.as_slice());
        assert_eq!(topic_address(&B256::from(t)), addr);
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(&[0u8; 224]), 7);
        assert_eq!(word_count(&[0u8; 200]), 6);
    }
}
