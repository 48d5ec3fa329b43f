//! Provisioning certificate chain extraction and ordering
//!
//! Admin-mode activation needs the domain certificate chain in the
//! order AMT expects it: leaf first, then intermediates, then the
//! self-signed root. The root is fingerprinted so it can be checked
//! against the trusted hashes the device reports.

use crate::error::{CertError, Result};
use base64::prelude::*;
use der::pem::LineEnding;
use der::{Decode, DecodePem, Encode};
use p12_keystore::{KeyStore, KeyStoreEntry};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;
use x509_cert::Certificate;

/// A single certificate from a provisioning chain
#[derive(Clone, PartialEq, Eq)]
pub struct ChainCertificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    subject_hash: String,
    issuer_hash: String,
}

impl ChainCertificate {
    /// Decode a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(der)?;
        Self::from_parsed(&cert, der.to_vec())
    }

    /// Decode a single PEM certificate
    pub fn from_pem(pem: &str) -> Result<Self> {
        let cert = Certificate::from_pem(pem.as_bytes())?;
        let der = cert.to_der()?;
        Self::from_parsed(&cert, der)
    }

    fn from_parsed(cert: &Certificate, der: Vec<u8>) -> Result<Self> {
        let subject = &cert.tbs_certificate.subject;
        let issuer = &cert.tbs_certificate.issuer;

        Ok(Self {
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            subject_hash: hex::encode(Sha1::digest(subject.to_der()?)),
            issuer_hash: hex::encode(Sha1::digest(issuer.to_der()?)),
            der,
        })
    }

    /// DER encoding
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name (RFC 4514 form)
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name (RFC 4514 form)
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// SHA-1 of the DER-encoded subject name
    pub fn subject_hash(&self) -> &str {
        &self.subject_hash
    }

    /// SHA-1 of the DER-encoded issuer name
    pub fn issuer_hash(&self) -> &str {
        &self.issuer_hash
    }

    /// Subject and issuer are the same name
    pub fn is_self_signed(&self) -> bool {
        self.subject_hash == self.issuer_hash
    }

    /// Base64 of the DER encoding, the form AMT's AddNextCertInChain takes
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.der)
    }

    /// PEM armoured certificate
    pub fn to_pem(&self) -> Result<String> {
        der::pem::encode_string("CERTIFICATE", LineEnding::LF, &self.der)
            .map_err(|e| CertError::InvalidCertificate(e.to_string()))
    }
}

impl fmt::Debug for ChainCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainCertificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// PKCS#8 DER private key. Never printed, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    pub fn from_pkcs8_der(der: impl Into<Vec<u8>>) -> Self {
        Self(der.into())
    }

    pub fn der(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Everything pulled out of a PKCS#12 bundle
#[derive(Debug, Clone)]
pub struct PfxContents {
    /// Certificates, key chains first (leaf leading each chain)
    pub certificates: Vec<ChainCertificate>,
    pub keys: Vec<PrivateKey>,
}

/// Root certificate fingerprints, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFingerprint {
    pub sha1: String,
    pub sha256: String,
}

impl RootFingerprint {
    fn of(der: &[u8]) -> Self {
        Self {
            sha1: hex::encode(Sha1::digest(der)),
            sha256: hex::encode(Sha256::digest(der)),
        }
    }
}

/// Ordered chain: leaf at index 0, self-signed root last
#[derive(Debug, Clone)]
pub struct ProvisioningCertificateChain {
    pub certificates: Vec<ChainCertificate>,
    pub private_key: Option<PrivateKey>,
    pub fingerprint: RootFingerprint,
}

impl ProvisioningCertificateChain {
    pub fn leaf(&self) -> Option<&ChainCertificate> {
        self.certificates.first()
    }

    pub fn root(&self) -> Option<&ChainCertificate> {
        self.certificates.last()
    }

    /// Whether the root fingerprint appears in the device's trusted hash list.
    /// AMT reports SHA-256 hashes on current firmware and SHA-1 on older parts.
    pub fn is_trusted_by<S: AsRef<str>>(&self, hashes: &[S]) -> bool {
        hashes.iter().any(|hash| {
            let hash = hash.as_ref();
            hash.eq_ignore_ascii_case(&self.fingerprint.sha256)
                || hash.eq_ignore_ascii_case(&self.fingerprint.sha1)
        })
    }
}

/// Turns a PKCS#12 blob into an ordered, fingerprinted chain
pub struct CertificateChainBuilder;

impl CertificateChainBuilder {
    /// Decode a base64 PFX and extract its certificates and private keys.
    ///
    /// A wrong passphrase or a malformed bundle is reported as
    /// [`CertError::Decryption`].
    pub fn parse(pfx_base64: &str, passphrase: &str) -> Result<PfxContents> {
        let compact: String = pfx_base64.split_whitespace().collect();
        let pfx = BASE64_STANDARD.decode(compact.as_bytes())?;

        let keystore = KeyStore::from_pkcs12(&pfx, passphrase)
            .map_err(|e| CertError::Decryption(e.to_string()))?;

        let mut certificates: Vec<ChainCertificate> = Vec::new();
        let mut keys = Vec::new();
        let mut standalone = Vec::new();

        for (alias, entry) in keystore.entries() {
            match entry {
                KeyStoreEntry::PrivateKeyChain(chain) => {
                    debug!(alias = %alias, certs = chain.chain().len(), "Found key chain in PFX");
                    keys.push(PrivateKey::from_pkcs8_der(chain.key()));
                    for cert in chain.chain() {
                        push_unique(&mut certificates, ChainCertificate::from_der(cert.as_der())?);
                    }
                }
                KeyStoreEntry::Certificate(cert) => standalone.push(cert.as_der().to_vec()),
            }
        }

        for der in standalone {
            push_unique(&mut certificates, ChainCertificate::from_der(&der)?);
        }

        Ok(PfxContents { certificates, keys })
    }

    /// Order certificates leaf → intermediates → root and fingerprint the root.
    ///
    /// The first certificate is taken as the leaf and the first other
    /// self-signed certificate as the root. Intermediates whose issuer
    /// is not the root go next to the leaf, the rest next to the root,
    /// each group in encountered order. Chains with more than one
    /// intermediate on either side are not topologically sorted.
    pub fn order(certificates: Vec<ChainCertificate>) -> Result<(Vec<ChainCertificate>, RootFingerprint)> {
        let mut iter = certificates.into_iter();
        let leaf = iter.next().ok_or(CertError::EmptyChain)?;
        let rest: Vec<ChainCertificate> = iter.collect();

        if rest.is_empty() {
            // A lone self-signed certificate is its own root
            if leaf.is_self_signed() {
                let fingerprint = RootFingerprint::of(leaf.der());
                return Ok((vec![leaf], fingerprint));
            }
            return Err(CertError::MissingRoot);
        }

        let root_index = rest
            .iter()
            .position(ChainCertificate::is_self_signed)
            .ok_or(CertError::MissingRoot)?;

        let mut rest = rest;
        let root = rest.remove(root_index);

        let (near_leaf, near_root): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|cert| cert.issuer_hash() != root.subject_hash());

        let fingerprint = RootFingerprint::of(root.der());

        let mut chain = Vec::with_capacity(near_leaf.len() + near_root.len() + 2);
        chain.push(leaf);
        chain.extend(near_leaf);
        chain.extend(near_root);
        chain.push(root);

        Ok((chain, fingerprint))
    }

    /// Parse and order in one go, keeping the first private key
    pub fn build(pfx_base64: &str, passphrase: &str) -> Result<ProvisioningCertificateChain> {
        let PfxContents { certificates, keys } = Self::parse(pfx_base64, passphrase)?;
        let (certificates, fingerprint) = Self::order(certificates)?;

        debug!(
            certs = certificates.len(),
            root_sha256 = %fingerprint.sha256,
            "Ordered provisioning certificate chain"
        );

        Ok(ProvisioningCertificateChain {
            certificates,
            private_key: keys.into_iter().next(),
            fingerprint,
        })
    }
}

fn push_unique(certificates: &mut Vec<ChainCertificate>, cert: ChainCertificate) {
    if !certificates.iter().any(|c| c.der() == cert.der()) {
        certificates.push(cert);
    }
}
