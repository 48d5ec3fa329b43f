//! `rps check-config`: load everything `serve` would and report on it

use crate::config::RpsConfig;
use color_eyre::eyre::{bail, Result};
use rps_certs::CertificateChainBuilder;
use rps_services::ProfileCatalogue;
use std::fmt::Write;

pub async fn run(config: &RpsConfig) -> Result<()> {
    let profiles = config.load_profiles().await?;
    let catalogue = profiles.catalogue();
    print!("{}", summary(config, catalogue));

    let problems = problems(catalogue);
    if problems.is_empty() {
        println!("Configuration OK");
        return Ok(());
    }
    for problem in &problems {
        println!("problem: {problem}");
    }
    bail!("{} problem(s) in the profile catalogue", problems.len())
}

fn summary(config: &RpsConfig, catalogue: &ProfileCatalogue) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "listen:   {}", config.server.listen);
    let _ = writeln!(
        out,
        "secrets:  {}",
        config.vault.as_ref().map_or("in memory".to_string(), |v| v.address.clone())
    );
    let _ = writeln!(
        out,
        "mps:      {}",
        if config.mps.api_url.is_empty() { "in memory" } else { config.mps.api_url.as_str() }
    );
    let _ = writeln!(
        out,
        "tls ca:   {}",
        config
            .server
            .tls_ca_key
            .as_ref()
            .map_or("generated at start-up".to_string(), |p| p.display().to_string())
    );
    for profile in &catalogue.profiles {
        let _ = writeln!(
            out,
            "profile {} ({:?}) cira={} tls={:?} wifi={}",
            profile.name,
            profile.activation,
            profile.cira_config.as_deref().unwrap_or("-"),
            profile.tls_mode,
            profile.wifi_profiles.len()
        );
    }
    for domain in &catalogue.domains {
        let _ = writeln!(out, "domain {} suffix={}", domain.name, domain.suffix);
    }
    out
}

/// Dangling references and unreadable provisioning certificates
fn problems(catalogue: &ProfileCatalogue) -> Vec<String> {
    let mut problems = Vec::new();
    for profile in &catalogue.profiles {
        if let Some(cira) = &profile.cira_config {
            if !catalogue.cira_configs.iter().any(|c| &c.name == cira) {
                problems.push(format!("profile {} names unknown CIRA config {cira}", profile.name));
            }
        }
        for wifi in &profile.wifi_profiles {
            if !catalogue.wireless_profiles.iter().any(|w| &w.name == wifi) {
                problems.push(format!("profile {} names unknown wireless profile {wifi}", profile.name));
            }
        }
        if profile.amt_password.is_none() && !profile.generate_random_password {
            problems.push(format!("profile {} has no AMT password", profile.name));
        }
    }
    for domain in &catalogue.domains {
        if let Err(e) = CertificateChainBuilder::build(
            &domain.provisioning_cert,
            domain.provisioning_cert_password.expose(),
        ) {
            problems.push(format!("domain {}: {e}", domain.name));
        }
    }
    problems
}
