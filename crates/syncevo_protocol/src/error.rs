//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// A frame announced more bytes than allowed.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A sync report could not be parsed.
    #[error("invalid sync report: {0}")]
    InvalidReport(#[from] serde_json::Error),

    /// Unknown sync mode name.
    #[error("unknown sync mode '{0}'")]
    UnknownSyncMode(String),
}

impl ProtocolError {
    /// Creates an encoding error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }

    /// Creates a decoding error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}
