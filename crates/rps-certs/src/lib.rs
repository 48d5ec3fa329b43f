//! Certificate handling for AMT provisioning
//!
//! - [`CertificateChainBuilder`] extracts and orders the domain
//!   provisioning chain from a PKCS#12 bundle and fingerprints its root
//! - [`sign_setup_nonces`] produces the admin-setup signature
//! - [`TlsCertificateIssuer`] signs device TLS certificates

pub mod chain;
pub mod error;
pub mod issuer;
pub mod signing;

pub use chain::{
    CertificateChainBuilder, ChainCertificate, PfxContents, PrivateKey,
    ProvisioningCertificateChain, RootFingerprint,
};
pub use error::{CertError, Result};
pub use issuer::TlsCertificateIssuer;
pub use signing::{sign_setup_nonces, MC_NONCE_LEN};
