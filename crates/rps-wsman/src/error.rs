//! Error types for WS-Management framing

use thiserror::Error;

/// Error type for WS-Management operations
#[derive(Debug, Error)]
pub enum WsmanError {
    /// Request could not be rendered
    #[error("encode failed: {0}")]
    Encode(String),

    /// Response body could not be parsed
    #[error("decode failed: {0}")]
    Decode(String),

    /// Raw HTTP response was not well formed
    #[error("malformed HTTP response: {0}")]
    Http(String),

    /// WWW-Authenticate header could not be understood
    #[error("invalid digest challenge: {0}")]
    Challenge(String),
}

impl From<serde_json::Error> for WsmanError {
    fn from(err: serde_json::Error) -> Self {
        WsmanError::Decode(err.to_string())
    }
}

/// Result type for WS-Management operations
pub type Result<T> = std::result::Result<T, WsmanError>;
