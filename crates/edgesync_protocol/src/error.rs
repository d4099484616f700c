//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating or encoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A record failed boundary validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// An unrecognised sync action.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// An unrecognised operating mode.
    #[error("unknown operating mode: {0}")]
    UnknownMode(String),

    /// A malformed query string or timestamp.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a signed request is rejected by the receiver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A required authentication header is absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// The key identifier is not registered.
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// The timestamp header is not a unix millisecond value.
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// The timestamp is outside the accepted clock skew.
    #[error("stale request: {skew_ms}ms from receiver clock")]
    StaleTimestamp {
        /// Absolute difference from the receiver clock.
        skew_ms: u64,
    },

    /// The signature does not match the request.
    #[error("invalid signature")]
    BadSignature,
}
