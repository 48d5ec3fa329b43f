//! `rps inspect-pfx`: show how a provisioning certificate will be sent

use base64::prelude::*;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use rps_certs::{CertificateChainBuilder, ProvisioningCertificateChain};
use std::fmt::Write;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct InspectPfxArgs {
    /// PFX file, binary or base64
    pub file: PathBuf,

    /// PFX passphrase
    #[arg(short, long, default_value = "")]
    pub password: String,
}

pub async fn run(args: InspectPfxArgs) -> Result<()> {
    let raw = tokio::fs::read(&args.file)
        .await
        .wrap_err_with(|| format!("cannot read {}", args.file.display()))?;
    let chain = CertificateChainBuilder::build(&pfx_base64(&raw), &args.password)
        .wrap_err_with(|| format!("cannot extract a chain from {}", args.file.display()))?;
    print!("{}", describe(&chain));
    Ok(())
}

/// Files exported from a profile store are already base64
fn pfx_base64(raw: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        let compact: String = text.split_whitespace().collect();
        if !compact.is_empty() && BASE64_STANDARD.decode(&compact).is_ok() {
            return compact;
        }
    }
    BASE64_STANDARD.encode(raw)
}

/// Chain in send order, leaf first
fn describe(chain: &ProvisioningCertificateChain) -> String {
    let mut out = String::new();
    let last = chain.certificates.len().saturating_sub(1);
    for (index, cert) in chain.certificates.iter().enumerate() {
        let role = match index {
            0 => "leaf",
            i if i == last => "root",
            _ => "intermediate",
        };
        let _ = writeln!(out, "{index}: [{role}] {}", cert.subject());
        let _ = writeln!(out, "   issuer: {}", cert.issuer());
    }
    let _ = writeln!(out, "root sha1:   {}", chain.fingerprint.sha1);
    let _ = writeln!(out, "root sha256: {}", chain.fingerprint.sha256);
    let _ = writeln!(
        out,
        "private key: {}",
        if chain.private_key.is_some() { "present" } else { "missing" }
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PFX: &str = include_str!("../../crates/rps-certs/tests/fixtures/provisioning.pfx.b64");

    #[test]
    fn test_base64_and_binary_input() {
        let binary = BASE64_STANDARD.decode(PFX.trim()).unwrap();
        assert_eq!(pfx_base64(PFX.as_bytes()), PFX.trim());
        assert_eq!(pfx_base64(&binary), PFX.trim());
    }

    #[test]
    fn test_describe_fixture() {
        let chain = CertificateChainBuilder::build(PFX, "P@ssw0rd").unwrap();
        let text = describe(&chain);
        assert!(text.starts_with("0: [leaf]"));
        assert!(text.contains("2: [root]"));
        assert!(text.contains("root sha256: 5358b024931bd06aa171dd8d258d0ff8dcfe1aa9c326bb6c254688fba2d35ce1"));
        assert!(text.contains("private key: present"));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, PFX.as_bytes()).unwrap();
        let args = InspectPfxArgs {
            file: file.path().to_path_buf(),
            password: "wrong".to_string(),
        };
        assert!(run(args).await.is_err());
    }
}
