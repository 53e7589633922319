use thiserror::Error;

/// Typed error hierarchy for the feed service.
///
/// Library-internal errors use specific variants; application code wraps with
/// `anyhow::Context` for propagation. Per-event handlers never let these
/// escape — they are recorded in the metrics error ring and the handler
/// continues.
#[derive(Error, Debug)]
pub enum FeedError {
    // -- Transport ----------------------------------------------------------
    #[error("node transport error: {0}")]
    Transport(String),

    #[error("node RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC timed out after {timeout_seconds}s ({method})")]
    RpcTimeout {
        method: String,
        timeout_seconds: u64,
    },

    #[error("node connection lost and reconnect attempts exhausted")]
    ReconnectExhausted,

    // -- Pool loading -------------------------------------------------------
    #[error("pool load failed for {pool}: {reason}")]
    PoolLoadFailed { pool: String, reason: String },

    #[error("token {token} is not a member of pool {pool}")]
    TokenNotInPool { token: String, pool: String },

    #[error("malformed return data for {call}: {reason}")]
    BadReturnData { call: String, reason: String },

    // -- Validation ---------------------------------------------------------
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown pair type: {0}")]
    UnknownPair(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FeedError>;
