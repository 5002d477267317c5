//! Protocol error types.

/// Errors raised while parsing protocol text.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The handshake line did not have the expected shape.
    #[error("malformed handshake line '{line}': {reason}")]
    MalformedHandshake {
        /// The raw line received from the plugin.
        line: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A capability name is not one the host knows how to dispense.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
