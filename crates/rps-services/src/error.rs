//! Error types for external collaborators

use thiserror::Error;

/// Error type for collaborator calls
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Request could not be sent or the connection failed
    #[error("request failed: {0}")]
    Request(String),

    /// Collaborator answered with a non-success status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response or file could not be decoded
    #[error("parse error: {0}")]
    Parse(String),

    /// Misconfigured collaborator
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error reading local data
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::Parse(err.to_string())
        } else {
            ServiceError::Request(err.to_string())
        }
    }
}

impl From<toml::de::Error> for ServiceError {
    fn from(err: toml::de::Error) -> Self {
        ServiceError::Parse(err.to_string())
    }
}

/// Result type for collaborator calls
pub type Result<T> = std::result::Result<T, ServiceError>;
