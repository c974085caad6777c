//! Error types for request decoding.

use thiserror::Error;

/// Errors that can occur when decoding control-plane messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The request type is not one this worker understands.
    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    /// The params did not match the request type.
    #[error("invalid params for {request_type}: {message}")]
    InvalidParams {
        request_type: String,
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}
