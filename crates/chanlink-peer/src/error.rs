use std::time::Duration;

/// Errors that can occur in connection and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] chanlink_transport::TransportError),

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A payload could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// An encoded packet exceeds the configured limit.
    #[error("packet too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The connection is closing or gone.
    #[error("connection closed")]
    Closed,

    /// The transport never confirmed an outgoing connection.
    #[error("connection not activated within {0:?}")]
    ActivationTimeout(Duration),

    /// The context already tracks its maximum number of connections.
    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    /// An I/O error, e.g. spawning the I/O thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A payload failed to parse. Contained inside the receiving channel.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// JSON deserialization failed.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload bytes were rejected by a custom parser.
    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// A payload failed to serialize.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A custom serializer refused the value.
    #[error("cannot encode payload: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;
