//! Local CA for AMT TLS certificates
//!
//! AMT generates its own RSA key pair; we only see the public half.
//! The issuer signs a server certificate for that key so AMT can
//! terminate TLS on its management port.

use crate::error::Result;
use chrono::{Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PublicKeyData, SignatureAlgorithm,
};
use tracing::info;

const CA_VALIDITY_YEARS: i32 = 10;
const DEVICE_VALIDITY_YEARS: i32 = 5;

/// AMT's RSA public key as returned in `AMT_PublicPrivateKeyPair.DERKey`
struct DevicePublicKey<'a> {
    pkcs1_der: &'a [u8],
}

impl PublicKeyData for DevicePublicKey<'_> {
    fn der_bytes(&self) -> &[u8] {
        self.pkcs1_der
    }

    fn algorithm(&self) -> &SignatureAlgorithm {
        &rcgen::PKCS_RSA_SHA256
    }
}

/// Signs TLS server certificates for devices
pub struct TlsCertificateIssuer {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TlsCertificateIssuer {
    /// Create a CA with a freshly generated key
    pub fn generate(common_name: &str) -> Result<Self> {
        let ca_key = KeyPair::generate()?;
        Self::with_key(common_name, ca_key)
    }

    /// Create a CA around an existing PKCS#8 PEM key
    pub fn from_key_pem(common_name: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)?;
        Self::with_key(common_name, ca_key)
    }

    fn with_key(common_name: &str, ca_key: KeyPair) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_YEARS);

        let ca_cert = params.self_signed(&ca_key)?;
        info!(common_name = %common_name, "Initialised TLS issuing CA");

        Ok(Self { ca_cert, ca_key })
    }

    /// CA certificate, DER
    pub fn ca_der(&self) -> &[u8] {
        self.ca_cert.der()
    }

    /// CA certificate, PEM
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Issue a server certificate for a PKCS#1 RSA public key
    pub fn issue(&self, device_public_key: &[u8], common_name: &str) -> Result<Vec<u8>> {
        let mut params = CertificateParams::new(vec![common_name.to_string()])?;
        params.distinguished_name = distinguished_name(common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params, DEVICE_VALIDITY_YEARS);

        let key = DevicePublicKey {
            pkcs1_der: device_public_key,
        };
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        Ok(cert.der().to_vec())
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "RPS");
    dn
}

fn set_validity(params: &mut CertificateParams, years: i32) {
    let start = Utc::now() - Duration::days(1);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    // Day 28 keeps the end date valid in every month
    params.not_after = rcgen::date_time_ymd(start.year() + years, start.month() as u8, start.day().min(28) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{CertificateChainBuilder, ChainCertificate};
    use der::Decode;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    const PFX: &str = include_str!("../tests/fixtures/provisioning.pfx.b64");

    fn device_key() -> Vec<u8> {
        let chain = CertificateChainBuilder::build(PFX, "P@ssw0rd").unwrap();
        let private = RsaPrivateKey::from_pkcs8_der(chain.private_key.unwrap().der()).unwrap();
        RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn test_ca_is_self_signed() {
        let issuer = TlsCertificateIssuer::generate("RPS Device CA").unwrap();
        let ca = ChainCertificate::from_der(issuer.ca_der()).unwrap();
        assert!(ca.is_self_signed());
        assert!(ca.subject().contains("RPS Device CA"));
        assert!(issuer.ca_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_issue_device_certificate() {
        let issuer = TlsCertificateIssuer::generate("RPS Device CA").unwrap();
        let der = issuer.issue(&device_key(), "amt-device-01").unwrap();

        let cert = ChainCertificate::from_der(&der).unwrap();
        let ca = ChainCertificate::from_der(issuer.ca_der()).unwrap();
        assert_eq!(cert.issuer_hash(), ca.subject_hash());
        assert!(cert.subject().contains("amt-device-01"));

        let parsed = x509_cert::Certificate::from_der(&der).unwrap();
        let spki = parsed.tbs_certificate.subject_public_key_info;
        assert_eq!(spki.subject_public_key.raw_bytes(), device_key().as_slice());
    }
}
