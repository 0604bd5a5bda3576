//! Error types for the runtime protocol.

use thiserror::Error;

/// Errors raised while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The record cannot be safely interpreted: the discriminator is missing
    /// or unknown, or a required field is absent or mistyped.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent(message.into())
    }
}

/// Convenience result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
