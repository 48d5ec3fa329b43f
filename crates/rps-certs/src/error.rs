//! Error types for certificate handling

use thiserror::Error;

/// Error type for certificate operations
#[derive(Debug, Error)]
pub enum CertError {
    /// The PFX blob was not valid base64
    #[error("invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Wrong passphrase or a structurally invalid PKCS#12 bundle
    #[error("unable to decrypt PKCS#12 bundle: {0}")]
    Decryption(String),

    /// A certificate could not be decoded
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Private key missing, unsupported or unusable
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// No certificates to order
    #[error("certificate chain is empty")]
    EmptyChain,

    /// No self-signed certificate in the chain
    #[error("certificate chain has no self-signed root")]
    MissingRoot,

    /// Signing failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// Certificate issuing failed
    #[error("certificate issuing failed: {0}")]
    Issuing(String),
}

impl From<der::Error> for CertError {
    fn from(err: der::Error) -> Self {
        CertError::InvalidCertificate(err.to_string())
    }
}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::Issuing(err.to_string())
    }
}

/// Result type for certificate operations
pub type Result<T> = std::result::Result<T, CertError>;
