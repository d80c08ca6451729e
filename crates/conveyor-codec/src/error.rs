use thiserror::Error;

/// Errors returned by envelope/payload codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input exceeds the accepted envelope size; not parsed at all.
    #[error("envelope too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    /// JSON syntax error or schema mismatch at the envelope level.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// `msg_type` outside the known payload table.
    #[error("unknown message type {0}")]
    UnknownMessageType(i64),
    /// Missing field, wrong value type, or out-of-range value.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A path field exceeds `MAX_PATH_LEN` hops.
    #[error("path too long: {0} hops")]
    PathTooLong(usize),
}
