//! poolpulse — real-time AMM pool price and swap-event fan-out for BSC.
//!
//! Subscribes to on-chain pool events over a node WebSocket, derives
//! per-token mid-prices from V2 reserves or V3 √price state, aggregates
//! across pools with outlier rejection and priority weighting, and pushes
//! updates to subscribed clients on a pub/sub socket. Optionally watches the
//! mempool for pending swaps and emits lifecycle events to a downstream
//! confirmation consumer.

pub mod abi;
pub mod chain;
pub mod classifier;
pub mod config;
pub mod confirm;
pub mod constants;
pub mod errors;
pub mod fanout;
pub mod mempool;
pub mod metrics;
pub mod pool;
pub mod price;
pub mod registry;
pub mod types;
