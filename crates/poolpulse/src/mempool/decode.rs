//! Calldata decoding for pending swap transactions.
//!
//! Dispatches on the 4-byte method selector: pool-direct `swap` calls decode
//! their amounts (enough to classify direction immediately); router calls
//! decode just the token path, since their direction is resolved later from
//! the emitted log. Unknown selectors are ignored — the overwhelming
//! majority of transactions are not swaps on monitored pools.

use alloy::primitives::{Address, Bytes, I256, U256};
use alloy::sol_types::SolValue;

use crate::abi;
use crate::constants::*;

#[derive(Debug, Clone)]
pub struct DecodedPending {
    pub selector: [u8; 4],
    pub call: PendingCall,
}

#[derive(Debug, Clone)]
pub enum PendingCall {
    /// `swap(uint256,uint256,address,bytes)` sent straight to a V2 pair.
    V2PoolSwap {
        amount0_out: U256,
        amount1_out: U256,
        to: Address,
    },
    /// `swap(address,bool,int256,uint160,bytes)` sent straight to a V3 pool.
    V3PoolSwap {
        recipient: Address,
        zero_for_one: bool,
        amount_specified: I256,
    },
    /// A V2-style router swap; only the path endpoints matter here.
    V2Router {
        token_in: Address,
        token_out: Address,
    },
    /// A V3-style router swap (single-hop or packed path).
    V3Router {
        token_in: Address,
        token_out: Address,
    },
}

/// Attempt to decode pending-transaction calldata as a swap.
pub fn decode_pending(calldata: &[u8]) -> Option<DecodedPending> {
    if calldata.len() < 4 {
        return None;
    }
    let selector: [u8; 4] = calldata[..4].try_into().expect("slice is exactly 4 bytes");
    let args = &calldata[4..];

    let call = match selector {
        SEL_V2_POOL_SWAP => {
            let (amount0_out, amount1_out, to, _data) =
                <(U256, U256, Address, Bytes)>::abi_decode_params(args).ok()?;
            PendingCall::V2PoolSwap {
                amount0_out,
                amount1_out,
                to,
            }
        }
        SEL_V3_POOL_SWAP => {
            let (recipient, zero_for_one, amount_specified, _limit, _data) =
                <(Address, bool, I256, U256, Bytes)>::abi_decode_params(args).ok()?;
            PendingCall::V3PoolSwap {
                recipient,
                zero_for_one,
                amount_specified,
            }
        }

        // ETH-input V2 router functions: (amount, path, to, deadline).
        SEL_SWAP_EXACT_ETH_FOR_TOKENS
        | SEL_SWAP_EXACT_ETH_FOR_TOKENS_FEE
        | SEL_SWAP_ETH_FOR_EXACT_TOKENS => {
            let (_amount, path, _to, _deadline) =
                <(U256, Vec<Address>, Address, U256)>::abi_decode_params(args).ok()?;
            v2_path_endpoints(&path)?
        }

        // Token-input V2 router functions: (amount, amount, path, to, deadline).
        SEL_SWAP_EXACT_TOKENS_FOR_TOKENS
        | SEL_SWAP_EXACT_TOKENS_FOR_ETH
        | SEL_SWAP_TOKENS_FOR_EXACT_TOKENS
        | SEL_SWAP_TOKENS_FOR_EXACT_ETH
        | SEL_SWAP_EXACT_TOKENS_FOR_TOKENS_FEE
        | SEL_SWAP_EXACT_TOKENS_FOR_ETH_FEE => {
            let (_a, _b, path, _to, _deadline) =
                <(U256, U256, Vec<Address>, Address, U256)>::abi_decode_params(args).ok()?;
            v2_path_endpoints(&path)?
        }

        // V3 single-hop: the params struct is static, so tokenIn/tokenOut
        // sit in the first two words.
        SEL_EXACT_INPUT_SINGLE | SEL_EXACT_OUTPUT_SINGLE => {
            let token_in = abi::word_address(args, 0)?;
            let token_out = abi::word_address(args, 1)?;
            PendingCall::V3Router {
                token_in,
                token_out,
            }
        }

        // V3 packed-path variants: (bytes path, address, uint256, uint256, uint256)
        // wrapped in a dynamic struct.
        SEL_EXACT_INPUT => {
            let ((path, _recipient, _deadline, _in, _out_min),) =
                <((Bytes, Address, U256, U256, U256),)>::abi_decode_params(args).ok()?;
            let (token_in, token_out) = parse_v3_path(&path)?;
            PendingCall::V3Router {
                token_in,
                token_out,
            }
        }
        SEL_EXACT_OUTPUT => {
            let ((path, _recipient, _deadline, _out, _in_max),) =
                <((Bytes, Address, U256, U256, U256),)>::abi_decode_params(args).ok()?;
            // exactOutput paths are reversed: token_out first, token_in last.
            let (token_out, token_in) = parse_v3_path(&path)?;
            PendingCall::V3Router {
                token_in,
                token_out,
            }
        }

        _ => return None,
    };

    Some(DecodedPending { selector, call })
}

fn v2_path_endpoints(path: &[Address]) -> Option<PendingCall> {
    if path.len() < 2 {
        return None;
    }
    Some(PendingCall::V2Router {
        token_in: path[0],
        token_out: *path.last().expect("path len >= 2"),
    })
}

/// Parse a V3 packed path to extract the first and last token addresses.
///
/// Path format: `token (20 bytes) || fee (3 bytes) || token (20 bytes) || …`,
/// minimum 43 bytes.
pub fn parse_v3_path(path: &[u8]) -> Option<(Address, Address)> {
    if path.len() < 43 {
        return None;
    }
    let first = Address::from_slice(&path[..20]);
    let last = Address::from_slice(&path[path.len() - 20..]);
    Some((first, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_selector(selector: [u8; 4], params: Vec<u8>) -> Vec<u8> {
        let mut out = selector.to_vec();
        out.extend_from_slice(&params);
        out
    }

    #[test]
    fn test_v2_pool_swap() {
        let to = Address::repeat_byte(0x05);
        let params = (
            U256::from(1_000u64),
            U256::ZERO,
            to,
            Bytes::new(),
        )
            .abi_encode_params();
        let calldata = with_selector(SEL_V2_POOL_SWAP, params);

        match decode_pending(&calldata).unwrap().call {
            PendingCall::V2PoolSwap {
                amount0_out,
                amount1_out,
                to: decoded_to,
            } => {
                assert_eq!(amount0_out, U256::from(1_000u64));
                assert_eq!(amount1_out, U256::ZERO);
                assert_eq!(decoded_to, to);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_v3_pool_swap() {
        let recipient = Address::repeat_byte(0x06);
        let params = (
            recipient,
            true,
            I256::try_from(5_000i64).unwrap(),
            U256::ZERO,
            Bytes::new(),
        )
            .abi_encode_params();
        let calldata = with_selector(SEL_V3_POOL_SWAP, params);

        match decode_pending(&calldata).unwrap().call {
            PendingCall::V3PoolSwap {
                recipient: r,
                zero_for_one,
                amount_specified,
            } => {
                assert_eq!(r, recipient);
                assert!(zero_for_one);
                assert_eq!(amount_specified, I256::try_from(5_000i64).unwrap());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_v2_router_path_endpoints() {
        let token_in = Address::repeat_byte(0x0a);
        let mid = Address::repeat_byte(0x0b);
        let token_out = Address::repeat_byte(0x0c);
        let params = (
            U256::from(1u64),
            U256::from(2u64),
            vec![token_in, mid, token_out],
            Address::repeat_byte(0x0d),
            U256::from(9_999_999u64),
        )
            .abi_encode_params();
        let calldata = with_selector(SEL_SWAP_EXACT_TOKENS_FOR_TOKENS, params);

        match decode_pending(&calldata).unwrap().call {
            PendingCall::V2Router {
                token_in: t_in,
                token_out: t_out,
            } => {
                assert_eq!(t_in, token_in);
                assert_eq!(t_out, token_out);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_v3_exact_input_single() {
        // Static struct: words land in order.
        let token_in = Address::repeat_byte(0x0a);
        let token_out = Address::repeat_byte(0x0b);
        let params = (
            token_in,
            token_out,
            U256::from(2500u64),
            Address::repeat_byte(0x0c),
            U256::from(1u64),
            U256::from(2u64),
            U256::from(3u64),
            U256::ZERO,
        )
            .abi_encode_params();
        let calldata = with_selector(SEL_EXACT_INPUT_SINGLE, params);

        match decode_pending(&calldata).unwrap().call {
            PendingCall::V3Router {
                token_in: t_in,
                token_out: t_out,
            } => {
                assert_eq!(t_in, token_in);
                assert_eq!(t_out, token_out);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_v3_exact_output_reverses_path() {
        let token_out = Address::repeat_byte(0x0a);
        let token_in = Address::repeat_byte(0x0b);
        let mut path = token_out.as_slice().to_vec();
        path.extend_from_slice(&[0x00, 0x09, 0xc4]);
        path.extend_from_slice(token_in.as_slice());

        let params = ((
            Bytes::from(path),
            Address::repeat_byte(0x0c),
            U256::from(1u64),
            U256::from(2u64),
            U256::from(3u64),
        ),)
            .abi_encode_params();
        let calldata = with_selector(SEL_EXACT_OUTPUT, params);

        match decode_pending(&calldata).unwrap().call {
            PendingCall::V3Router {
                token_in: t_in,
                token_out: t_out,
            } => {
                assert_eq!(t_in, token_in);
                assert_eq!(t_out, token_out);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_selector_ignored() {
        let calldata = with_selector([0xde, 0xad, 0xbe, 0xef], vec![0u8; 64]);
        assert!(decode_pending(&calldata).is_none());
        assert!(decode_pending(&[0x01, 0x02]).is_none());
    }

    #[test]
    fn test_short_v3_path_rejected() {
        assert!(parse_v3_path(&[0u8; 42]).is_none());
        assert!(parse_v3_path(&[0u8; 43]).is_some());
    }
}
