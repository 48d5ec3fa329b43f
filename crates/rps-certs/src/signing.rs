//! Admin-mode setup signature
//!
//! AMT's `AdminSetup` proves possession of the provisioning key by
//! signing the device's configuration nonce followed by our own nonce.

use crate::chain::PrivateKey;
use crate::error::{CertError, Result};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;

/// Length of the management console nonce AMT expects
pub const MC_NONCE_LEN: usize = 20;

/// RSA PKCS#1 v1.5 SHA-256 signature over `configuration_nonce || mc_nonce`
pub fn sign_setup_nonces(key: &PrivateKey, configuration_nonce: &[u8], mc_nonce: &[u8]) -> Result<Vec<u8>> {
    let rsa_key = RsaPrivateKey::from_pkcs8_der(key.der())
        .map_err(|e| CertError::InvalidKey(e.to_string()))?;
    let signer = SigningKey::<Sha256>::new(rsa_key);

    let mut data = Vec::with_capacity(configuration_nonce.len() + mc_nonce.len());
    data.extend_from_slice(configuration_nonce);
    data.extend_from_slice(mc_nonce);

    let signature = signer
        .try_sign(&data)
        .map_err(|e| CertError::Signing(e.to_string()))?;
    Ok(signature.to_vec())
}
