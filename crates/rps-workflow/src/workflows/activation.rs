//! Activation: the top-level workflow
//!
//! Resolves the profile, activates AMT in admin or client control mode,
//! persists the new credentials, then runs the configuration children in
//! order. Exactly one of CIRA and TLS runs last.

use super::{cira, features, item, network, tls, unconfiguration, SETUP_AND_CONFIGURATION_SERVICE};
use crate::device::{Device, DeviceSession};
use crate::engine::{expect_zero, Machine, Outcome, State};
use crate::error::{Fault, Result};
use crate::messages::DeviceStatus;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use md5::{Digest, Md5};
use rand::RngCore;
use regex::Regex;
use rps_certs::{sign_setup_nonces, CertificateChainBuilder, MC_NONCE_LEN};
use rps_services::{
    generate_password, ActivationMode, ActivationProfile, CiraProfile, DeviceRegistration, DeviceSecrets,
    DomainProfile, GENERATED_PASSWORD_LEN,
};
use rps_wsman::WsmanCall;
use serde_json::json;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

pub const NAME: &str = "activation";

const GENERAL_SETTINGS: &str = "AMT_GeneralSettings";
const HOST_BASED_SETUP_SERVICE: &str = "IPS_HostBasedSetupService";
static DIGEST_REALM: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new("^Digest:[0-9A-Fa-f]{32}$").ok());

fn is_valid_realm(realm: &str) -> bool {
    DIGEST_REALM.as_ref().is_some_and(|pattern| pattern.is_match(realm))
}

/// HTTP digest MD5 of `admin:realm:password`
const PASSWORD_ENCRYPTION_DIGEST: u8 = 2;
/// RSA SHA-256
const SIGNING_ALGORITHM_SHA256: u8 = 2;

/// Per-run state of the activation workflow
#[derive(Debug, Default)]
pub struct ActivationContext {
    pub profile: Option<ActivationProfile>,
    pub cira: Option<CiraProfile>,
    domain: Option<DomainProfile>,
    /// Control mode the client reported; devices already activated are refused
    current_mode: u8,
    admin_username: String,
    amt_password: String,
    mebx_password: Option<String>,
    digest_realm: String,
    realm_valid: bool,
    configuration_nonce: Vec<u8>,
    mc_nonce: Vec<u8>,
    cert_index: usize,
    chain_len: usize,
}

impl ActivationContext {
    fn mode(&self) -> Option<ActivationMode> {
        self.profile.as_ref().map(|p| p.activation)
    }

    fn is_admin(&self) -> bool {
        self.mode() == Some(ActivationMode::Admin)
    }

    /// `hex(md5("admin:<realm>:<password>"))`
    fn network_admin_password(&self) -> String {
        let digest = Md5::digest(format!("{}:{}:{}", self.admin_username, self.digest_realm, self.amt_password));
        hex::encode(digest)
    }
}

type S = State<ActivationContext>;

pub fn machine() -> Machine<ActivationContext> {
    Machine::new(NAME, "GET_PROFILE")
        .state(S::task("GET_PROFILE", load_profile).then("RESOLVE_PASSWORDS"))
        .state(S::task("RESOLVE_PASSWORDS", resolve_passwords).then("CHECK_MODE"))
        .state(
            S::decide("CHECK_MODE")
                .when("alreadyActivated", |c| c.current_mode != 0, "ALREADY_ACTIVATED")
                .when("isAdmin", ActivationContext::is_admin, "GET_DOMAIN_CERT")
                .then("GET_GENERAL_SETTINGS"),
        )
        .state(S::failure("ALREADY_ACTIVATED", |_| Fault::failed("Device is already activated")))
        .state(S::task("GET_DOMAIN_CERT", find_domain).then("EXTRACT_CERT_CHAIN"))
        .state(S::task("EXTRACT_CERT_CHAIN", extract_chain).then("GET_GENERAL_SETTINGS"))
        .state(
            S::call(
                "GET_GENERAL_SETTINGS",
                |_, _| Ok(WsmanCall::get(GENERAL_SETTINGS)),
                |c, envelope| {
                    let realm = item(envelope, GENERAL_SETTINGS)?["DigestRealm"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    c.realm_valid = is_valid_realm(&realm);
                    c.digest_realm = realm;
                    Ok(())
                },
            )
            .then("CHECK_DIGEST_REALM"),
        )
        .state(
            S::decide("CHECK_DIGEST_REALM")
                .when("invalidRealm", |c| !c.realm_valid, "INVALID_DIGEST_REALM")
                .when("isAdmin", ActivationContext::is_admin, "GET_HOST_BASED_SETUP")
                .then("CLIENT_SETUP"),
        )
        .state(S::failure("INVALID_DIGEST_REALM", |c| {
            Fault::InvalidDigestRealm(c.digest_realm.clone())
        }))
        .state(
            S::call(
                "GET_HOST_BASED_SETUP",
                |_, _| Ok(WsmanCall::get(HOST_BASED_SETUP_SERVICE)),
                |c, envelope| {
                    let nonce = item(envelope, HOST_BASED_SETUP_SERVICE)?["ConfigurationNonce"]
                        .as_str()
                        .ok_or_else(|| Fault::malformed("no ConfigurationNonce"))?;
                    c.configuration_nonce = STANDARD
                        .decode(nonce)
                        .map_err(|e| Fault::malformed(format!("ConfigurationNonce is not base64: {e}")))?;
                    let mut mc_nonce = vec![0u8; MC_NONCE_LEN];
                    rand::thread_rng().fill_bytes(&mut mc_nonce);
                    c.mc_nonce = mc_nonce;
                    Ok(())
                },
            )
            .then("ADD_NEXT_CERT_IN_CHAIN"),
        )
        .state(
            S::call("ADD_NEXT_CERT_IN_CHAIN", add_next_cert, |c, envelope| {
                expect_zero(envelope, "AddNextCertInChain")?;
                c.cert_index += 1;
                Ok(())
            })
            .when("moreCertificates", |c| c.cert_index < c.chain_len, "ADD_NEXT_CERT_IN_CHAIN")
            .then("ADMIN_SETUP"),
        )
        .state(
            S::call("ADMIN_SETUP", admin_setup, |_, envelope| expect_zero(envelope, "AdminSetup"))
                .then("DELAYED_TRANSITION"),
        )
        .state(
            S::call(
                "CLIENT_SETUP",
                |c, _| {
                    Ok(WsmanCall::invoke(
                        HOST_BASED_SETUP_SERVICE,
                        "Setup",
                        json!({
                            "NetAdminPassEncryptionType": PASSWORD_ENCRYPTION_DIGEST,
                            "NetworkAdminPassword": c.network_admin_password(),
                        }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "Setup"),
            )
            .then("DELAYED_TRANSITION"),
        )
        .state(S::delay("DELAYED_TRANSITION", |config| config.activation_settle()).then("UPDATE_CREDENTIALS"))
        .state(
            S::task("UPDATE_CREDENTIALS", update_credentials)
                .when(
                    "setMebxPassword",
                    |c| c.is_admin() && c.mebx_password.is_some(),
                    "SET_MEBX_PASSWORD",
                )
                .then("PERSIST_DEVICE"),
        )
        .state(
            S::call(
                "SET_MEBX_PASSWORD",
                |c, _| {
                    Ok(WsmanCall::invoke(
                        SETUP_AND_CONFIGURATION_SERVICE,
                        "SetMEBxPassword",
                        json!({ "Password": c.mebx_password.clone().unwrap_or_default() }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "SetMEBxPassword"),
            )
            .then("PERSIST_DEVICE"),
        )
        .state(S::task("PERSIST_DEVICE", persist_device).then("UNCONFIGURATION"))
        .state(S::child("UNCONFIGURATION", unconfiguration::NAME, run_unconfiguration).then("NETWORK_CONFIG"))
        .state(S::child("NETWORK_CONFIG", network::NAME, run_network).then("FEATURES_CONFIG"))
        .state(S::child("FEATURES_CONFIG", features::NAME, run_features).then("CHECK_CIRA"))
        .state(
            S::decide("CHECK_CIRA")
                .when("hasCIRAProfile", |c| c.cira.is_some(), "CIRA")
                .then("TLS"),
        )
        .state(S::child("CIRA", cira::NAME, run_cira).then("PROVISIONED"))
        .state(S::child("TLS", tls::NAME, run_tls).then("PROVISIONED"))
        .state(S::success("PROVISIONED"))
}

/// Run activation as a top-level workflow.
///
/// Children that record their own status key do not overwrite `Status`.
/// The provisioning key is dropped when the run ends either way.
pub async fn run(device: &mut Device) -> Outcome {
    let mut ctx = ActivationContext {
        current_mode: device.session.payload.current_mode,
        admin_username: device.engine_config().admin_username.clone(),
        ..Default::default()
    };
    let outcome = machine().run(&mut ctx, device).await;
    device.session.certificate_chain = None;

    if let Outcome::Failed(fault) = &outcome {
        let reported_by_child = matches!(
            fault,
            Fault::Child { workflow, .. } if *workflow != unconfiguration::NAME
        );
        if !reported_by_child {
            device.session.status.set(DeviceStatus::STATUS, fault.to_string());
        }
    }
    outcome
}

fn load_profile<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let name = device.session.payload.profile.clone();
        let profiles = device.services.profiles.clone();
        let profile = profiles
            .get_profile(&name)
            .await
            .map_err(|e| Fault::collaborator("profile source", e))?
            .ok_or_else(|| Fault::failed(format!("Profile {name} not found")))?;

        if let Some(cira_name) = &profile.cira_config {
            let cira = profiles
                .get_cira_config(cira_name)
                .await
                .map_err(|e| Fault::collaborator("profile source", e))?
                .ok_or_else(|| Fault::failed(format!("CIRA config {cira_name} not found")))?;
            ctx.cira = Some(cira);
        }

        device.session.activation_mode = Some(profile.activation);
        info!(client_id = %device.client_id(), profile = %name, mode = ?profile.activation, "Loaded activation profile");
        ctx.profile = Some(profile);
        Ok(())
    })
}

fn resolve_passwords<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let profile = ctx.profile.as_ref().ok_or_else(|| Fault::failed("no profile loaded"))?;
        let amt_password = if profile.generate_random_password {
            Some(generate_password(GENERATED_PASSWORD_LEN))
        } else {
            profile.amt_password.as_ref().map(|p| p.expose().to_string())
        };
        let mebx_password = match profile.activation {
            ActivationMode::Admin if profile.generate_random_mebx_password => {
                Some(generate_password(GENERATED_PASSWORD_LEN))
            }
            ActivationMode::Admin => profile.mebx_password.as_ref().map(|p| p.expose().to_string()),
            ActivationMode::Client => None,
        };
        ctx.amt_password = amt_password
            .ok_or_else(|| Fault::failed(format!("No AMT password configured for profile {}", profile.name)))?;
        ctx.mebx_password = mebx_password;
        debug!(client_id = %device.client_id(), mebx = ctx.mebx_password.is_some(), "Resolved passwords");
        Ok(())
    })
}

fn find_domain<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let fqdn = device.session.payload.fqdn.clone();
        let domain = device
            .services
            .profiles
            .find_domain(&fqdn)
            .await
            .map_err(|e| Fault::collaborator("profile source", e))?
            .ok_or_else(|| {
                Fault::failed(format!(
                    "Specified AMT domain suffix: {fqdn} does not match list of available AMT domain suffixes."
                ))
            })?;
        debug!(client_id = %device.client_id(), domain = %domain.name, "Matched AMT domain");
        ctx.domain = Some(domain);
        Ok(())
    })
}

fn extract_chain<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let domain = ctx.domain.as_ref().ok_or_else(|| Fault::failed("no domain matched"))?;
        let chain = match CertificateChainBuilder::build(
            &domain.provisioning_cert,
            domain.provisioning_cert_password.expose(),
        ) {
            Ok(chain) => chain,
            Err(e) => {
                warn!(client_id = %device.client_id(), domain = %domain.name, error = %e, "Cannot read provisioning certificate");
                return Err(Fault::failed("Failed to extract domain certificate"));
            }
        };
        if chain.private_key.is_none() {
            warn!(client_id = %device.client_id(), domain = %domain.name, "Provisioning certificate has no private key");
            return Err(Fault::failed("Failed to extract domain certificate"));
        }
        if !chain.is_trusted_by(&device.session.payload.cert_hashes) {
            warn!(
                client_id = %device.client_id(),
                domain = %domain.name,
                root_sha256 = %chain.fingerprint.sha256,
                "Provisioning root is not trusted by the device"
            );
            return Err(Fault::failed("Failed to extract domain certificate"));
        }
        ctx.chain_len = chain.certificates.len();
        ctx.cert_index = 0;
        device.session.certificate_chain = Some(chain);
        Ok(())
    })
}

fn add_next_cert(ctx: &ActivationContext, session: &DeviceSession) -> Result<WsmanCall> {
    let chain = session
        .certificate_chain
        .as_ref()
        .ok_or_else(|| Fault::failed("no provisioning certificate chain"))?;
    let certificate = chain
        .certificates
        .get(ctx.cert_index)
        .ok_or_else(|| Fault::failed(format!("no certificate at chain index {}", ctx.cert_index)))?;
    Ok(WsmanCall::invoke(
        HOST_BASED_SETUP_SERVICE,
        "AddNextCertInChain",
        json!({
            "NextCertificate": certificate.to_base64(),
            "IsLeafCertificate": ctx.cert_index == 0,
            "IsRootCertificate": ctx.cert_index + 1 == chain.certificates.len(),
        }),
    ))
}

fn admin_setup(ctx: &ActivationContext, session: &DeviceSession) -> Result<WsmanCall> {
    let key = session
        .certificate_chain
        .as_ref()
        .and_then(|chain| chain.private_key.as_ref())
        .ok_or_else(|| Fault::Certificate("provisioning key is not loaded".to_string()))?;
    let signature = sign_setup_nonces(key, &ctx.configuration_nonce, &ctx.mc_nonce)
        .map_err(|e| Fault::Certificate(e.to_string()))?;
    Ok(WsmanCall::invoke(
        HOST_BASED_SETUP_SERVICE,
        "AdminSetup",
        json!({
            "NetAdminPassEncryptionType": PASSWORD_ENCRYPTION_DIGEST,
            "NetworkAdminPassword": ctx.network_admin_password(),
            "McNonce": STANDARD.encode(&ctx.mc_nonce),
            "SigningAlgorithm": SIGNING_ALGORITHM_SHA256,
            "DigitalSignature": STANDARD.encode(signature),
        }),
    ))
}

/// Switch to the admin account AMT now expects
fn update_credentials<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        device
            .session
            .connection
            .set_credentials(ctx.admin_username.clone(), ctx.amt_password.clone());
        let status = if ctx.is_admin() { "Admin control mode." } else { "Client control mode." };
        device.session.status.set(DeviceStatus::STATUS, status);
        info!(client_id = %device.client_id(), uuid = %device.session.uuid(), status, "Device activated");
        Ok(())
    })
}

fn persist_device<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let guid = device.session.uuid().to_string();
        let services = device.services.clone();
        let mut secrets = DeviceSecrets::load(services.secrets.as_ref(), &guid)
            .await
            .map_err(|e| Fault::collaborator("secret store", e))?
            .unwrap_or_default();
        secrets.amt_password = Some(ctx.amt_password.clone());
        secrets.mebx_password = ctx.mebx_password.clone();
        secrets
            .save(services.secrets.as_ref(), &guid)
            .await
            .map_err(|e| Fault::collaborator("secret store", e))?;

        let profile = ctx.profile.as_ref().ok_or_else(|| Fault::failed("no profile loaded"))?;
        let payload = &device.session.payload;
        let registration = DeviceRegistration {
            guid: guid.clone(),
            hostname: payload.hostname.clone(),
            mps_username: ctx.cira.as_ref().map(|c| c.username.clone()).unwrap_or_default(),
            tags: profile.tags.clone(),
            tenant_id: profile.tenant_id.clone(),
            friendly_name: payload.friendly_name.clone(),
            dns_suffix: None,
        };
        services
            .broker
            .register(&registration)
            .await
            .map_err(|e| Fault::collaborator("mps", e))?;
        debug!(client_id = %device.client_id(), %guid, "Persisted device");
        Ok(())
    })
}

fn run_unconfiguration<'a>(_ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let removed = unconfiguration::run(device).await?;
        debug!(client_id = %device.client_id(), wifi_endpoints = removed.deleted_wifi_endpoints, "Unconfigured device");
        Ok(())
    })
}

fn run_network<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let profile = ctx.profile.as_ref().ok_or_else(|| Fault::failed("no profile loaded"))?;
        network::run(device, profile).await
    })
}

fn run_features<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let profile = ctx.profile.as_ref().ok_or_else(|| Fault::failed("no profile loaded"))?;
        features::run(device, profile, profile.activation).await
    })
}

fn run_cira<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let profile = ctx.profile.as_ref().ok_or_else(|| Fault::failed("no profile loaded"))?;
        let cira_profile = ctx.cira.as_ref().ok_or_else(|| Fault::failed("no CIRA config loaded"))?;
        cira::run(device, profile, cira_profile).await
    })
}

fn run_tls<'a>(ctx: &'a mut ActivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let profile = ctx.profile.as_ref().ok_or_else(|| Fault::failed("no profile loaded"))?;
        tls::run(device, profile).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing;
    use rps_services::MemoryProfileSource;
    use std::sync::Arc;

    #[test]
    fn test_machine_is_well_formed() {
        machine().validate().unwrap();
    }

    #[test]
    fn test_network_admin_password() {
        let ctx = ActivationContext {
            admin_username: "admin".to_string(),
            digest_realm: "Digest:A3829B3827DE4D33D4449B366831FD01".to_string(),
            amt_password: "P@ssw0rd".to_string(),
            ..Default::default()
        };
        let expected = hex::encode(Md5::digest("admin:Digest:A3829B3827DE4D33D4449B366831FD01:P@ssw0rd"));
        assert_eq!(ctx.network_admin_password(), expected);
        assert_eq!(expected.len(), 32);
    }

    #[test]
    fn test_digest_realm_pattern() {
        assert!(DIGEST_REALM.is_some());
        assert!(is_valid_realm("Digest:A3829B3827DE4D33D4449B366831FD01"));
        assert!(is_valid_realm("Digest:a3829b3827de4d33d4449b366831fd01"));
        assert!(!is_valid_realm("Digest:INVALID"));
        assert!(!is_valid_realm("Digest:A3829B3827DE4D33D4449B366831FD0"));
        assert!(!is_valid_realm("Digest:A3829B3827DE4D33D4449B366831FD01 "));
    }

    #[tokio::test]
    async fn test_generated_passwords() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let mut profile = ActivationProfile::new("admin", ActivationMode::Admin);
        profile.generate_random_password = true;
        profile.generate_random_mebx_password = true;
        let mut ctx = ActivationContext {
            profile: Some(profile),
            ..Default::default()
        };
        resolve_passwords(&mut ctx, &mut device).await.unwrap();
        assert_eq!(ctx.amt_password.len(), GENERATED_PASSWORD_LEN);
        assert!(ctx.mebx_password.is_some());
    }

    #[tokio::test]
    async fn test_client_mode_has_no_mebx_password() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let profile = ActivationProfile::new("client", ActivationMode::Client)
            .with_amt_password("Client-P@ss1")
            .with_mebx_password("Mebx-P@ss1");
        let mut ctx = ActivationContext {
            profile: Some(profile),
            ..Default::default()
        };
        resolve_passwords(&mut ctx, &mut device).await.unwrap();
        assert_eq!(ctx.amt_password, "Client-P@ss1");
        assert!(ctx.mebx_password.is_none());
    }

    #[tokio::test]
    async fn test_missing_profile_fails() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        device.session.payload.profile = "nope".to_string();
        let mut ctx = ActivationContext::default();
        let fault = load_profile(&mut ctx, &mut device).await.unwrap_err();
        assert_eq!(fault.to_string(), "Profile nope not found");
    }

    #[tokio::test]
    async fn test_unknown_domain_suffix() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let mut services = testing::services();
        services.profiles = Arc::new(MemoryProfileSource::new());
        device.services = Arc::new(services);
        device.session.payload.fqdn = "host.unknown.test".to_string();
        let mut ctx = ActivationContext::default();
        let fault = find_domain(&mut ctx, &mut device).await.unwrap_err();
        assert!(fault.to_string().contains("host.unknown.test does not match"));
    }

    #[tokio::test]
    async fn test_already_activated_is_refused() {
        let (mut device, _pending, mut rx) = testing::device("dev-1").await;
        let mut services = testing::services();
        services.profiles = Arc::new(
            MemoryProfileSource::new()
                .with_profile(ActivationProfile::new("client", ActivationMode::Client).with_amt_password("Client-P@ss1")),
        );
        device.services = Arc::new(services);
        device.session.payload.profile = "client".to_string();
        device.session.payload.current_mode = 1;

        let outcome = run(&mut device).await;
        assert!(matches!(outcome, Outcome::Failed(ref f) if f.to_string() == "Device is already activated"));
        assert_eq!(device.session.status.get(DeviceStatus::STATUS), Some("Device is already activated"));
        assert!(rx.try_recv().is_err());
    }
}
