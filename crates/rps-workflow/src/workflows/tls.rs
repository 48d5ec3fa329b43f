//! TLS configuration: device key pair, signed certificate, then TLS on
//! the remote and local endpoints

use super::{
    instance_id, output, text, with_fields, TlsSettings, PUBLIC_KEY_MANAGEMENT_SERVICE, SETUP_AND_CONFIGURATION_SERVICE,
    TLS_SETTING_DATA,
};
use crate::device::{Device, DeviceSession, AMT_TLS_PORT};
use crate::engine::{expect_zero, Machine, State};
use crate::error::{Fault, Result};
use crate::messages::DeviceStatus;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::future::BoxFuture;
use rps_services::{ActivationProfile, TlsMode};
use rps_wsman::{as_i64, Envelope, Selector, WsmanCall};
use serde_json::{json, Value};
use tracing::info;

pub const NAME: &str = "tls";

const KEY_PAIR: &str = "AMT_PublicPrivateKeyPair";
const TLS_CREDENTIAL_CONTEXT: &str = "AMT_TLSCredentialContext";
const TIME_SYNCHRONIZATION_SERVICE: &str = "AMT_TimeSynchronizationService";
const PROTOCOL_ENDPOINT_COLLECTION: &str = "AMT_TLSProtocolEndpointCollection";

/// RSA
const KEY_ALGORITHM_RSA: u8 = 0;
const KEY_LENGTH: u32 = 2048;

/// Per-run state of the TLS workflow
#[derive(Debug)]
pub struct TlsContext {
    mode: Option<TlsMode>,
    key_pair_reference: Option<Value>,
    public_key: Vec<u8>,
    certificate_reference: Option<Value>,
    ta0: Option<i64>,
    settings: TlsSettings,
}

impl TlsContext {
    pub fn new(mode: Option<TlsMode>) -> Self {
        Self {
            mode,
            key_pair_reference: None,
            public_key: Vec::new(),
            certificate_reference: None,
            ta0: None,
            settings: TlsSettings::default(),
        }
    }
}

type S = State<TlsContext>;

pub fn machine() -> Machine<TlsContext> {
    Machine::new(NAME, "CHECK_TLS_MODE")
        .state(
            S::decide("CHECK_TLS_MODE")
                .when("noTlsMode", |c| c.mode.is_none(), "SUCCESS")
                .then("ADD_TRUSTED_ROOT_CERTIFICATE"),
        )
        .state(S::task("ADD_TRUSTED_ROOT_CERTIFICATE", add_trusted_root).then("GENERATE_KEY_PAIR"))
        .state(
            S::call(
                "GENERATE_KEY_PAIR",
                |_, _| {
                    Ok(WsmanCall::invoke(
                        PUBLIC_KEY_MANAGEMENT_SERVICE,
                        "GenerateKeyPair",
                        json!({ "KeyAlgorithm": KEY_ALGORITHM_RSA, "KeyLength": KEY_LENGTH }),
                    ))
                },
                store_key_pair_reference,
            )
            .then("ENUMERATE_PUBLIC_PRIVATE_KEY_PAIR"),
        )
        .state(S::enumerate("ENUMERATE_PUBLIC_PRIVATE_KEY_PAIR", KEY_PAIR).then("PULL_PUBLIC_PRIVATE_KEY_PAIR"))
        .state(S::pull("PULL_PUBLIC_PRIVATE_KEY_PAIR", KEY_PAIR, store_public_key).then("SIGN_AND_ADD_CERTIFICATE"))
        .state(S::task("SIGN_AND_ADD_CERTIFICATE", sign_and_add_certificate).then("ADD_TLS_CREDENTIAL_CONTEXT"))
        .state(
            S::call("ADD_TLS_CREDENTIAL_CONTEXT", add_credential_context, |_, _| Ok(()))
                .then("GET_LOW_ACCURACY_TIME_SYNCH"),
        )
        .state(
            S::call(
                "GET_LOW_ACCURACY_TIME_SYNCH",
                |_, _| Ok(WsmanCall::invoke(TIME_SYNCHRONIZATION_SERVICE, "GetLowAccuracyTimeSynch", json!({}))),
                |c, envelope| {
                    expect_zero(envelope, "GetLowAccuracyTimeSynch")?;
                    c.ta0 = as_i64(&output(envelope, "GetLowAccuracyTimeSynch")?["Ta0"]);
                    Ok(())
                },
            )
            .then("SET_HIGH_ACCURACY_TIME_SYNCH"),
        )
        .state(
            S::call("SET_HIGH_ACCURACY_TIME_SYNCH", set_time, |_, envelope| {
                expect_zero(envelope, "SetHighAccuracyTimeSynch")
            })
            .then("ENUMERATE_TLS_SETTING_DATA"),
        )
        .state(S::enumerate("ENUMERATE_TLS_SETTING_DATA", TLS_SETTING_DATA).then("PULL_TLS_SETTING_DATA"))
        .state(
            S::pull("PULL_TLS_SETTING_DATA", TLS_SETTING_DATA, |c, items| {
                c.settings = TlsSettings::from_items(&items);
                Ok(())
            })
            .then("PUT_REMOTE_TLS_SETTING_DATA"),
        )
        .state(S::call("PUT_REMOTE_TLS_SETTING_DATA", put_remote_settings, |_, _| Ok(())).then("PUT_LOCAL_TLS_SETTING_DATA"))
        .state(S::call("PUT_LOCAL_TLS_SETTING_DATA", put_local_settings, |_, _| Ok(())).then("COMMIT_CHANGES"))
        .state(
            S::call(
                "COMMIT_CHANGES",
                |_, _| Ok(WsmanCall::invoke(SETUP_AND_CONFIGURATION_SERVICE, "CommitChanges", json!({}))),
                |_, envelope| expect_zero(envelope, "CommitChanges"),
            )
            .then("TLS_SETTLE"),
        )
        .state(S::delay("TLS_SETTLE", |config| config.tls_settle()).then("SUCCESS"))
        .state(S::success("SUCCESS"))
}

/// Run as a child of activation.
///
/// A profile without a TLS mode succeeds without touching the device or
/// the `TLSConfiguration` status. Once TLS is on, later calls go to the
/// TLS port.
pub async fn run(device: &mut Device, profile: &ActivationProfile) -> Result<()> {
    let mut ctx = TlsContext::new(profile.tls_mode);
    let result = machine().run(&mut ctx, device).await.into_result();
    if profile.tls_mode.is_none() {
        return result;
    }
    match &result {
        Ok(()) => {
            device.session.status.set(DeviceStatus::TLS, "Configured");
            device.session.connection.port = AMT_TLS_PORT;
        }
        Err(fault) => device.session.status.set(DeviceStatus::TLS, fault.to_string()),
    }
    result
}

/// Trust the CA that signs device certificates
fn add_trusted_root<'a>(_ctx: &'a mut TlsContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let blob = STANDARD.encode(device.services.tls_issuer.ca_der());
        let call = WsmanCall::invoke(
            PUBLIC_KEY_MANAGEMENT_SERVICE,
            "AddTrustedRootCertificate",
            json!({ "CertificateBlob": blob }),
        );
        let envelope = device.call(&call).await?;
        expect_zero(&envelope, "AddTrustedRootCertificate")
    })
}

fn store_key_pair_reference(ctx: &mut TlsContext, envelope: &Envelope) -> Result<()> {
    expect_zero(envelope, "GenerateKeyPair")?;
    let reference = output(envelope, "GenerateKeyPair")?["KeyPair"].clone();
    ctx.key_pair_reference = (!reference.is_null()).then_some(reference);
    Ok(())
}

/// Public key of the pair just generated, or the newest pair when the
/// reference carries no selector
fn store_public_key(ctx: &mut TlsContext, items: Vec<Value>) -> Result<()> {
    let pair = match ctx.key_pair_reference.as_ref().and_then(selector_value) {
        Some(handle) => items
            .iter()
            .find(|item| text(item, "InstanceID") == Some(handle))
            .ok_or_else(|| Fault::malformed(format!("key pair {handle} not found on the device")))?,
        None => items.last().ok_or_else(|| Fault::malformed("no key pairs on the device"))?,
    };
    let der_key = text(pair, "DERKey").ok_or_else(|| Fault::malformed("key pair has no DERKey"))?;
    ctx.public_key = STANDARD
        .decode(der_key)
        .map_err(|e| Fault::malformed(format!("DERKey is not base64: {e}")))?;
    Ok(())
}

/// `ReferenceParameters.SelectorSet.Selector` value; a selector list yields its first entry
fn selector_value(reference: &Value) -> Option<&str> {
    let selector = &reference["ReferenceParameters"]["SelectorSet"]["Selector"];
    let selector = match selector {
        Value::Array(selectors) => selectors.first()?,
        other => other,
    };
    match selector {
        Value::String(value) => Some(value.as_str()),
        other => other["Value"].as_str(),
    }
}

fn sign_and_add_certificate<'a>(ctx: &'a mut TlsContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let common_name = match device.session.payload.hostname.as_str() {
            "" => device.session.uuid().to_string(),
            hostname => hostname.to_string(),
        };
        let certificate = device
            .services
            .tls_issuer
            .issue(&ctx.public_key, &common_name)
            .map_err(|e| Fault::Certificate(e.to_string()))?;
        let call = WsmanCall::invoke(
            PUBLIC_KEY_MANAGEMENT_SERVICE,
            "AddCertificate",
            json!({ "CertificateBlob": STANDARD.encode(certificate) }),
        );
        let envelope = device.call(&call).await?;
        expect_zero(&envelope, "AddCertificate")?;
        let reference = output(&envelope, "AddCertificate")?["CreatedCertificate"].clone();
        if reference.is_null() {
            return Err(Fault::malformed("AddCertificate response has no CreatedCertificate"));
        }
        ctx.certificate_reference = Some(reference);
        info!(client_id = %device.client_id(), %common_name, "Installed TLS certificate");
        Ok(())
    })
}

fn add_credential_context(ctx: &TlsContext, _: &DeviceSession) -> Result<WsmanCall> {
    let certificate = ctx
        .certificate_reference
        .clone()
        .ok_or_else(|| Fault::failed("no certificate to bind to the TLS endpoint"))?;
    Ok(WsmanCall::create(
        TLS_CREDENTIAL_CONTEXT,
        json!({
            "ElementInContext": certificate,
            "ElementProvidingContext": PROTOCOL_ENDPOINT_COLLECTION,
        }),
    ))
}

fn set_time(ctx: &TlsContext, _: &DeviceSession) -> Result<WsmanCall> {
    let ta0 = ctx.ta0.ok_or_else(|| Fault::malformed("GetLowAccuracyTimeSynch returned no Ta0"))?;
    let now = Utc::now().timestamp();
    Ok(WsmanCall::invoke(
        TIME_SYNCHRONIZATION_SERVICE,
        "SetHighAccuracyTimeSynch",
        json!({ "Ta0": ta0, "Tm1": now, "Tm2": now }),
    ))
}

fn put_remote_settings(ctx: &TlsContext, _: &DeviceSession) -> Result<WsmanCall> {
    let mode = ctx.mode.ok_or_else(|| Fault::failed("no TLS mode"))?;
    let id = instance_id(&ctx.settings.remote, "remote TLS setting")?;
    let current = ctx.settings.remote.clone().unwrap_or_default();
    Ok(WsmanCall::put(
        TLS_SETTING_DATA,
        with_fields(
            &current,
            json!({
                "Enabled": true,
                "AcceptNonSecureConnections": mode.accepts_non_secure(),
                "MutualAuthentication": mode.mutual_authentication(),
            }),
        ),
    )
    .with_selector(Selector::new("InstanceID", id)))
}

fn put_local_settings(ctx: &TlsContext, _: &DeviceSession) -> Result<WsmanCall> {
    let id = instance_id(&ctx.settings.local, "local TLS setting")?;
    let current = ctx.settings.local.clone().unwrap_or_default();
    Ok(WsmanCall::put(TLS_SETTING_DATA, with_fields(&current, json!({ "Enabled": true })))
        .with_selector(Selector::new("InstanceID", id)))
}
