//! Client-initiated remote access (CIRA) tunnel configuration
//!
//! Installs the MPS trust root, persists the tunnel password, registers
//! the device with the broker, then adds the MPS server entry and the
//! user-initiated access policy.

use super::{item, output, with_fields, ENVIRONMENT_DETECTION, PUBLIC_KEY_MANAGEMENT_SERVICE};
use crate::device::{Device, DeviceSession};
use crate::engine::{expect_zero, Machine, State};
use crate::error::{Fault, Result};
use crate::messages::DeviceStatus;
use futures::future::BoxFuture;
use rps_services::{
    generate_password, ActivationProfile, CiraProfile, DeviceRegistration, DeviceSecrets, GENERATED_PASSWORD_LEN,
};
use rps_wsman::{Envelope, WsmanCall};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

pub const NAME: &str = "cira";

const REMOTE_ACCESS_SERVICE: &str = "AMT_RemoteAccessService";
const USER_INITIATED_CONNECTION_SERVICE: &str = "AMT_UserInitiatedConnectionService";

/// Mutual password authentication against the MPS
const MPS_AUTH_PASSWORD: u8 = 2;
/// Periodic trigger; the tunnel is kept open
const TRIGGER_PERIODIC: u8 = 2;
const POLICY_EXTENDED_DATA: &str = "AAAAAAAAABk=";
/// BIOS and OS initiated connections allowed
const USER_INITIATED_ALL: u32 = 32771;

/// Per-run state of the CIRA workflow
#[derive(Debug)]
pub struct CiraContext {
    profile: ActivationProfile,
    cira: CiraProfile,
    device_uuid: String,
    mps_password: String,
    root_certificate: String,
    mp_server: Option<Value>,
    environment: Value,
}

impl CiraContext {
    pub fn new(profile: ActivationProfile, cira: CiraProfile) -> Self {
        Self {
            profile,
            cira,
            device_uuid: String::new(),
            mps_password: String::new(),
            root_certificate: String::new(),
            mp_server: None,
            environment: Value::Null,
        }
    }
}

type S = State<CiraContext>;

pub fn machine() -> Machine<CiraContext> {
    Machine::new(NAME, "GET_CIRA_CONFIG")
        .state(S::task("GET_CIRA_CONFIG", resolve_cira_config).then("ADD_TRUSTED_ROOT_CERTIFICATE"))
        .state(
            S::call(
                "ADD_TRUSTED_ROOT_CERTIFICATE",
                |c, _| {
                    Ok(WsmanCall::invoke(
                        PUBLIC_KEY_MANAGEMENT_SERVICE,
                        "AddTrustedRootCertificate",
                        json!({ "CertificateBlob": c.root_certificate }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "AddTrustedRootCertificate"),
            )
            .then("SAVE_MPS_PASSWORD"),
        )
        .state(S::task("SAVE_MPS_PASSWORD", save_mps_password).then("REGISTER_DEVICE"))
        .state(S::task("REGISTER_DEVICE", register_device).then("ADD_MPS"))
        .state(S::call("ADD_MPS", add_mps_server, check_mps_server).then("ADD_REMOTE_ACCESS_POLICY_RULE"))
        .state(
            S::call(
                "ADD_REMOTE_ACCESS_POLICY_RULE",
                add_policy_rule,
                |_, envelope| expect_zero(envelope, "AddRemoteAccessPolicyRule"),
            )
            .then("ENABLE_USER_INITIATED_CONNECTION"),
        )
        .state(
            S::call(
                "ENABLE_USER_INITIATED_CONNECTION",
                |_, _| {
                    Ok(WsmanCall::invoke(
                        USER_INITIATED_CONNECTION_SERVICE,
                        "RequestStateChange",
                        json!({ "RequestedState": USER_INITIATED_ALL }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "RequestStateChange"),
            )
            .then("GET_ENVIRONMENT_DETECTION_SETTINGS"),
        )
        .state(
            S::call(
                "GET_ENVIRONMENT_DETECTION_SETTINGS",
                |_, _| Ok(WsmanCall::get(ENVIRONMENT_DETECTION)),
                |c, envelope| {
                    c.environment = item(envelope, ENVIRONMENT_DETECTION)?.clone();
                    Ok(())
                },
            )
            .then("PUT_ENVIRONMENT_DETECTION_SETTINGS"),
        )
        .state(
            S::call(
                "PUT_ENVIRONMENT_DETECTION_SETTINGS",
                |c, _| {
                    let detection = format!("{}.com", Uuid::new_v4().simple());
                    Ok(WsmanCall::put(
                        ENVIRONMENT_DETECTION,
                        with_fields(&c.environment, json!({ "DetectionStrings": [detection] })),
                    ))
                },
                |_, _| Ok(()),
            )
            .then("SUCCESS"),
        )
        .state(S::success("SUCCESS"))
}

/// Run as a child of activation, recording the `CIRAConnection` status
pub async fn run(device: &mut Device, profile: &ActivationProfile, cira: &CiraProfile) -> Result<()> {
    let mut ctx = CiraContext::new(profile.clone(), cira.clone());
    let result = machine().run(&mut ctx, device).await.into_result();
    let status = match &result {
        Ok(()) => "Configured".to_string(),
        Err(fault) => fault.to_string(),
    };
    device.session.status.set(DeviceStatus::CIRA, status);
    result
}

fn resolve_cira_config<'a>(ctx: &'a mut CiraContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        ctx.device_uuid = device.session.uuid().to_string();
        ctx.mps_password = match &ctx.cira.password {
            Some(password) => password.expose().to_string(),
            None => generate_password(GENERATED_PASSWORD_LEN),
        };
        ctx.root_certificate = ctx
            .cira
            .mps_root_certificate
            .clone()
            .filter(|cert| !cert.is_empty())
            .unwrap_or_else(|| device.services.mps.root_certificate.clone());
        if ctx.root_certificate.is_empty() {
            return Err(Fault::failed(format!(
                "No MPS root certificate configured for CIRA profile {}",
                ctx.cira.name
            )));
        }
        debug!(client_id = %device.client_id(), cira = %ctx.cira.name, "Resolved CIRA settings");
        Ok(())
    })
}

fn save_mps_password<'a>(ctx: &'a mut CiraContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let store = device.services.secrets.clone();
        let mut secrets = DeviceSecrets::load(store.as_ref(), &ctx.device_uuid)
            .await
            .map_err(|e| Fault::collaborator("secret store", e))?
            .unwrap_or_default();
        secrets.mps_password = Some(ctx.mps_password.clone());
        secrets
            .save(store.as_ref(), &ctx.device_uuid)
            .await
            .map_err(|e| Fault::collaborator("secret store", e))
    })
}

fn register_device<'a>(ctx: &'a mut CiraContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let payload = &device.session.payload;
        let registration = DeviceRegistration {
            guid: ctx.device_uuid.clone(),
            hostname: payload.hostname.clone(),
            mps_username: ctx.cira.username.clone(),
            tags: ctx.profile.tags.clone(),
            tenant_id: ctx.profile.tenant_id.clone(),
            friendly_name: payload.friendly_name.clone(),
            dns_suffix: dns_suffix(&payload.fqdn, &payload.hostname),
        };
        device
            .services
            .broker
            .register(&registration)
            .await
            .map_err(|e| Fault::collaborator("mps", e))?;
        info!(client_id = %device.client_id(), guid = %ctx.device_uuid, "Registered device with MPS");
        Ok(())
    })
}

/// Domain part of the FQDN once the host label is removed
fn dns_suffix(fqdn: &str, hostname: &str) -> Option<String> {
    let suffix = fqdn
        .strip_prefix(hostname)
        .and_then(|rest| rest.strip_prefix('.'))
        .or_else(|| fqdn.split_once('.').map(|(_, rest)| rest))?;
    (!suffix.is_empty()).then(|| suffix.to_string())
}

fn add_mps_server(ctx: &CiraContext, _: &DeviceSession) -> Result<WsmanCall> {
    Ok(WsmanCall::invoke(
        REMOTE_ACCESS_SERVICE,
        "AddMpServer",
        json!({
            "AccessInfo": ctx.cira.mps_server_address,
            "InfoFormat": ctx.cira.address_format(),
            "Port": ctx.cira.mps_port,
            "AuthMethod": MPS_AUTH_PASSWORD,
            "Username": ctx.cira.username,
            "Password": ctx.mps_password,
            "CN": ctx.cira.common_name,
        }),
    ))
}

fn check_mps_server(ctx: &mut CiraContext, envelope: &Envelope) -> Result<()> {
    match envelope.return_value("AddMpServer") {
        Some(0) => {}
        Some(value) => {
            return Err(Fault::failed(format!(
                "Failed to add MPS server for device {}: AddMpServer returned {value}",
                ctx.device_uuid
            )))
        }
        None => return Err(Fault::malformed("AddMpServer response has no ReturnValue")),
    }
    let reference = output(envelope, "AddMpServer")?["MpServer"].clone();
    if reference.is_null() {
        return Err(Fault::malformed("AddMpServer response has no MpServer reference"));
    }
    ctx.mp_server = Some(reference);
    Ok(())
}

fn add_policy_rule(ctx: &CiraContext, _: &DeviceSession) -> Result<WsmanCall> {
    let mp_server = ctx
        .mp_server
        .clone()
        .ok_or_else(|| Fault::failed("no MPS server reference to attach the policy to"))?;
    Ok(WsmanCall::invoke(
        REMOTE_ACCESS_SERVICE,
        "AddRemoteAccessPolicyRule",
        json!({
            "Trigger": TRIGGER_PERIODIC,
            "TunnelLifeTime": 0,
            "ExtendedData": POLICY_EXTENDED_DATA,
            "MpServer": mp_server,
        }),
    ))
}
