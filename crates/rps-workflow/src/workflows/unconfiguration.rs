//! Strip prior configuration before a new profile is applied
//!
//! Every removal is idempotent: lists are pulled fresh and drained one
//! instance at a time, and policy rules that are already gone are fine.

use super::{
    collect_field, instance_id, item, text, with_fields, EthernetPorts, TlsSettings, ENVIRONMENT_DETECTION,
    ETHERNET_PORT_SETTINGS, SETUP_AND_CONFIGURATION_SERVICE, TLS_SETTING_DATA,
};
use crate::device::{Device, DeviceSession};
use crate::engine::{expect_zero, Machine, State};
use crate::error::Result;
use crate::recovery::Expected;
use rps_wsman::{as_bool, as_i64, Envelope, Selector, WsmanCall};
use serde_json::{json, Value};

pub const NAME: &str = "unconfiguration";

const IEEE8021X_SETTINGS: &str = "IPS_IEEE8021xSettings";
const WIFI_ENDPOINT_SETTINGS: &str = "CIM_WiFiEndpointSettings";
const POLICY_RULE: &str = "AMT_RemoteAccessPolicyRule";
const REMOTE_SAP: &str = "AMT_ManagementPresenceRemoteSAP";
const CREDENTIAL_CONTEXT: &str = "AMT_TLSCredentialContext";
const KEY_PAIR: &str = "AMT_PublicPrivateKeyPair";
const KEY_CERTIFICATE: &str = "AMT_PublicKeyCertificate";

/// Per-run state of the unconfiguration workflow
#[derive(Debug, Default)]
pub struct UnconfigurationContext {
    ports: EthernetPorts,
    ieee8021x: Option<Value>,
    wifi_endpoints: Vec<String>,
    remote_saps: Vec<String>,
    tls: TlsSettings,
    credential_contexts: Vec<String>,
    key_pairs: Vec<String>,
    certificates: Vec<String>,
    detection: Option<Value>,
    /// Wi-Fi endpoint profiles removed during this run
    pub deleted_wifi_endpoints: usize,
}

type S = State<UnconfigurationContext>;

pub fn machine() -> Machine<UnconfigurationContext> {
    Machine::new(NAME, "ENUMERATE_ETHERNET_PORT_SETTINGS")
        .state(S::enumerate("ENUMERATE_ETHERNET_PORT_SETTINGS", ETHERNET_PORT_SETTINGS).then("PULL_ETHERNET_PORT_SETTINGS"))
        .state(
            S::pull("PULL_ETHERNET_PORT_SETTINGS", ETHERNET_PORT_SETTINGS, store_ports)
                .when("hasWiredMac", |c| c.ports.has_wired_mac(), "GET_8021X_PROFILE")
                .then("CHECK_WIFI"),
        )
        .state(
            S::call("GET_8021X_PROFILE", |_, _| Ok(WsmanCall::get(IEEE8021X_SETTINGS)), store_8021x)
                .expect(Expected::NotFound, "CHECK_WIFI")
                .when("is8021xEnabled", is_8021x_enabled, "DISABLE_8021X_PROFILE")
                .then("CHECK_WIFI"),
        )
        .state(S::call("DISABLE_8021X_PROFILE", disable_8021x, |_, _| Ok(())).then("CHECK_WIFI"))
        .state(
            S::decide("CHECK_WIFI")
                .when("hasWirelessMac", |c| c.ports.has_wireless_mac(), "ENUMERATE_WIFI_ENDPOINT_SETTINGS")
                .then("DELETE_USER_INITIATED_RULE"),
        )
        .state(S::enumerate("ENUMERATE_WIFI_ENDPOINT_SETTINGS", WIFI_ENDPOINT_SETTINGS).then("PULL_WIFI_ENDPOINT_SETTINGS"))
        .state(
            S::pull("PULL_WIFI_ENDPOINT_SETTINGS", WIFI_ENDPOINT_SETTINGS, |c, items| {
                c.wifi_endpoints = collect_field(&items, "InstanceID");
                Ok(())
            })
            .when("hasWifiProfiles", |c| !c.wifi_endpoints.is_empty(), "DELETE_WIFI_ENDPOINT_SETTINGS")
            .then("DELETE_USER_INITIATED_RULE"),
        )
        .state(
            S::call("DELETE_WIFI_ENDPOINT_SETTINGS", delete_wifi_endpoint, |c, _| {
                pop_head(&mut c.wifi_endpoints);
                c.deleted_wifi_endpoints += 1;
                Ok(())
            })
            .when("hasWifiProfiles", |c| !c.wifi_endpoints.is_empty(), "DELETE_WIFI_ENDPOINT_SETTINGS")
            .then("DELETE_USER_INITIATED_RULE"),
        )
        .state(
            S::call("DELETE_USER_INITIATED_RULE", |_, _| Ok(delete_rule("User Initiated")), |_, _| Ok(()))
                .expect(Expected::BadRequest, "DELETE_ALERT_RULE")
                .then("DELETE_ALERT_RULE"),
        )
        .state(
            S::call("DELETE_ALERT_RULE", |_, _| Ok(delete_rule("Alert")), |_, _| Ok(()))
                .tolerate("DELETE_PERIODIC_RULE")
                .then("DELETE_PERIODIC_RULE"),
        )
        .state(
            S::call("DELETE_PERIODIC_RULE", |_, _| Ok(delete_rule("Periodic")), |_, _| Ok(()))
                .tolerate("ENUMERATE_MANAGEMENT_PRESENCE_REMOTE_SAP")
                .then("ENUMERATE_MANAGEMENT_PRESENCE_REMOTE_SAP"),
        )
        .state(S::enumerate("ENUMERATE_MANAGEMENT_PRESENCE_REMOTE_SAP", REMOTE_SAP).then("PULL_MANAGEMENT_PRESENCE_REMOTE_SAP"))
        .state(
            S::pull("PULL_MANAGEMENT_PRESENCE_REMOTE_SAP", REMOTE_SAP, |c, items| {
                c.remote_saps = collect_field(&items, "Name");
                Ok(())
            })
            .when("hasRemoteSap", |c| !c.remote_saps.is_empty(), "DELETE_MANAGEMENT_PRESENCE_REMOTE_SAP")
            .then("ENUMERATE_TLS_SETTING_DATA"),
        )
        .state(
            S::call(
                "DELETE_MANAGEMENT_PRESENCE_REMOTE_SAP",
                |c, _| Ok(delete_head(REMOTE_SAP, "Name", &c.remote_saps)),
                |c, _| {
                    pop_head(&mut c.remote_saps);
                    Ok(())
                },
            )
            .when("hasRemoteSap", |c| !c.remote_saps.is_empty(), "DELETE_MANAGEMENT_PRESENCE_REMOTE_SAP")
            .then("ENUMERATE_TLS_SETTING_DATA"),
        )
        .state(S::enumerate("ENUMERATE_TLS_SETTING_DATA", TLS_SETTING_DATA).then("PULL_TLS_SETTING_DATA"))
        .state(
            S::pull("PULL_TLS_SETTING_DATA", TLS_SETTING_DATA, |c, items| {
                c.tls = TlsSettings::from_items(&items);
                Ok(())
            })
            .when("isTlsEnabled", |c| c.tls.any_enabled(), "DISABLE_REMOTE_TLS_SETTING_DATA")
            .then("ENUMERATE_TLS_CREDENTIAL_CONTEXT"),
        )
        .state(
            S::call("DISABLE_REMOTE_TLS_SETTING_DATA", |c, _| disable_tls(&c.tls.remote, "remote TLS"), |_, _| Ok(()))
                .then("DISABLE_LOCAL_TLS_SETTING_DATA"),
        )
        .state(
            S::call("DISABLE_LOCAL_TLS_SETTING_DATA", |c, _| disable_tls(&c.tls.local, "local TLS"), |_, _| Ok(()))
                .then("COMMIT_CHANGES"),
        )
        .state(
            S::call(
                "COMMIT_CHANGES",
                |_, _| Ok(WsmanCall::invoke(SETUP_AND_CONFIGURATION_SERVICE, "CommitChanges", json!({}))),
                |_, envelope| expect_zero(envelope, "CommitChanges"),
            )
            .then("TLS_SETTLE"),
        )
        .state(S::delay("TLS_SETTLE", |config| config.tls_settle()).then("ENUMERATE_TLS_CREDENTIAL_CONTEXT"))
        .state(S::enumerate("ENUMERATE_TLS_CREDENTIAL_CONTEXT", CREDENTIAL_CONTEXT).then("PULL_TLS_CREDENTIAL_CONTEXT"))
        .state(
            S::pull("PULL_TLS_CREDENTIAL_CONTEXT", CREDENTIAL_CONTEXT, |c, items| {
                c.credential_contexts = collect_field(&items, "ElementInContext");
                Ok(())
            })
            .when("hasCredentialContext", |c| !c.credential_contexts.is_empty(), "DELETE_TLS_CREDENTIAL_CONTEXT")
            .then("ENUMERATE_PUBLIC_PRIVATE_KEY_PAIR"),
        )
        .state(
            S::call(
                "DELETE_TLS_CREDENTIAL_CONTEXT",
                |c, _| Ok(delete_head(CREDENTIAL_CONTEXT, "ElementInContext", &c.credential_contexts)),
                |c, _| {
                    pop_head(&mut c.credential_contexts);
                    Ok(())
                },
            )
            .when("hasCredentialContext", |c| !c.credential_contexts.is_empty(), "DELETE_TLS_CREDENTIAL_CONTEXT")
            .then("ENUMERATE_PUBLIC_PRIVATE_KEY_PAIR"),
        )
        .state(S::enumerate("ENUMERATE_PUBLIC_PRIVATE_KEY_PAIR", KEY_PAIR).then("PULL_PUBLIC_PRIVATE_KEY_PAIR"))
        .state(
            S::pull("PULL_PUBLIC_PRIVATE_KEY_PAIR", KEY_PAIR, |c, items| {
                c.key_pairs = collect_field(&items, "InstanceID");
                Ok(())
            })
            .when("hasKeyPair", |c| !c.key_pairs.is_empty(), "DELETE_PUBLIC_PRIVATE_KEY_PAIR")
            .then("ENUMERATE_PUBLIC_KEY_CERTIFICATE"),
        )
        .state(
            S::call(
                "DELETE_PUBLIC_PRIVATE_KEY_PAIR",
                |c, _| Ok(delete_head(KEY_PAIR, "InstanceID", &c.key_pairs)),
                |c, _| {
                    pop_head(&mut c.key_pairs);
                    Ok(())
                },
            )
            .when("hasKeyPair", |c| !c.key_pairs.is_empty(), "DELETE_PUBLIC_PRIVATE_KEY_PAIR")
            .then("ENUMERATE_PUBLIC_KEY_CERTIFICATE"),
        )
        .state(S::enumerate("ENUMERATE_PUBLIC_KEY_CERTIFICATE", KEY_CERTIFICATE).then("PULL_PUBLIC_KEY_CERTIFICATE"))
        .state(
            S::pull("PULL_PUBLIC_KEY_CERTIFICATE", KEY_CERTIFICATE, store_certificates)
                .when("hasCertificate", |c| !c.certificates.is_empty(), "DELETE_PUBLIC_KEY_CERTIFICATE")
                .then("GET_ENVIRONMENT_DETECTION_SETTINGS"),
        )
        .state(
            S::call(
                "DELETE_PUBLIC_KEY_CERTIFICATE",
                |c, _| Ok(delete_head(KEY_CERTIFICATE, "InstanceID", &c.certificates)),
                |c, _| {
                    pop_head(&mut c.certificates);
                    Ok(())
                },
            )
            .when("hasCertificate", |c| !c.certificates.is_empty(), "DELETE_PUBLIC_KEY_CERTIFICATE")
            .then("GET_ENVIRONMENT_DETECTION_SETTINGS"),
        )
        .state(
            S::call(
                "GET_ENVIRONMENT_DETECTION_SETTINGS",
                |_, _| Ok(WsmanCall::get(ENVIRONMENT_DETECTION)),
                |c, envelope| {
                    c.detection = Some(item(envelope, ENVIRONMENT_DETECTION)?.clone());
                    Ok(())
                },
            )
            .expect(Expected::NotFound, "SUCCESS")
            .when("hasDetectionStrings", has_detection_strings, "CLEAR_ENVIRONMENT_DETECTION_SETTINGS")
            .then("SUCCESS"),
        )
        .state(S::call("CLEAR_ENVIRONMENT_DETECTION_SETTINGS", clear_detection, |_, _| Ok(())).then("SUCCESS"))
        .state(S::success("SUCCESS"))
}

/// Run as a child of activation
pub async fn run(device: &mut Device) -> Result<UnconfigurationContext> {
    let mut ctx = UnconfigurationContext::default();
    machine().run(&mut ctx, device).await.into_result()?;
    Ok(ctx)
}

fn store_ports(ctx: &mut UnconfigurationContext, items: Vec<Value>) -> Result<()> {
    ctx.ports = EthernetPorts::from_items(&items);
    Ok(())
}

fn store_8021x(ctx: &mut UnconfigurationContext, envelope: &Envelope) -> Result<()> {
    ctx.ieee8021x = Some(item(envelope, IEEE8021X_SETTINGS)?.clone());
    Ok(())
}

/// 2 enabled, 6 enabled without certificates
fn is_8021x_enabled(ctx: &UnconfigurationContext) -> bool {
    ctx.ieee8021x
        .as_ref()
        .and_then(|s| as_i64(&s["Enabled"]))
        .is_some_and(|state| state == 2 || state == 6)
}

fn disable_8021x(ctx: &UnconfigurationContext, _: &DeviceSession) -> Result<WsmanCall> {
    let current = ctx.ieee8021x.clone().unwrap_or_default();
    let id = instance_id(&ctx.ieee8021x, "802.1x")?;
    Ok(
        WsmanCall::put(IEEE8021X_SETTINGS, with_fields(&current, json!({ "Enabled": 3 })))
            .with_selector(Selector::new("InstanceID", id)),
    )
}

fn delete_wifi_endpoint(ctx: &UnconfigurationContext, _: &DeviceSession) -> Result<WsmanCall> {
    Ok(delete_head(WIFI_ENDPOINT_SETTINGS, "InstanceID", &ctx.wifi_endpoints))
}

fn delete_rule(name: &str) -> WsmanCall {
    WsmanCall::delete(POLICY_RULE, Selector::new("PolicyRuleName", name))
}

fn pop_head(list: &mut Vec<String>) {
    if !list.is_empty() {
        list.remove(0);
    }
}

fn delete_head(class: &str, key: &str, list: &[String]) -> WsmanCall {
    let value = list.first().cloned().unwrap_or_default();
    WsmanCall::delete(class, Selector::new(key, value))
}

fn disable_tls(setting: &Option<Value>, what: &str) -> Result<WsmanCall> {
    let id = instance_id(setting, what)?;
    let current = setting.clone().unwrap_or_default();
    Ok(
        WsmanCall::put(TLS_SETTING_DATA, with_fields(&current, json!({ "Enabled": false })))
            .with_selector(Selector::new("InstanceID", id)),
    )
}

/// Read-only certificates belong to the firmware and cannot be removed
fn store_certificates(ctx: &mut UnconfigurationContext, items: Vec<Value>) -> Result<()> {
    ctx.certificates = items
        .iter()
        .filter(|cert| !as_bool(&cert["ReadOnlyCertificate"]).unwrap_or(false))
        .filter_map(|cert| text(cert, "InstanceID"))
        .map(str::to_string)
        .collect();
    Ok(())
}

fn has_detection_strings(ctx: &UnconfigurationContext) -> bool {
    match ctx.detection.as_ref().map(|d| &d["DetectionStrings"]) {
        Some(Value::Array(strings)) => !strings.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}

fn clear_detection(ctx: &UnconfigurationContext, _: &DeviceSession) -> Result<WsmanCall> {
    let current = ctx.detection.clone().unwrap_or_default();
    Ok(WsmanCall::put(
        ENVIRONMENT_DETECTION,
        with_fields(&current, json!({ "DetectionStrings": [] })),
    ))
}
