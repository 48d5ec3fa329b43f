//! Wired and wireless network settings

use super::{instance_id, item, with_fields, EthernetPorts, ETHERNET_PORT_SETTINGS};
use crate::device::{Device, DeviceSession};
use crate::engine::{expect_zero, Machine, State};
use crate::error::{Fault, Result};
use crate::messages::DeviceStatus;
use futures::future::BoxFuture;
use rps_services::{wireless_passphrase, ActivationProfile, WirelessProfile};
use rps_wsman::{as_bool, Envelope, Selector, WsmanCall};
use serde_json::{json, Value};
use tracing::{info, warn};

pub const NAME: &str = "network";

const WIFI_PORT: &str = "CIM_WiFiPort";
const WIFI_PORT_CONFIGURATION_SERVICE: &str = "AMT_WiFiPortConfigurationService";
/// Enabled, responding to the operating system's Wi-Fi state
const WIFI_ENABLED_IN_S0: u32 = 32769;

/// Per-run state of the network workflow
#[derive(Debug)]
pub struct NetworkContext {
    profile: ActivationProfile,
    ports: EthernetPorts,
    ethernet_configured: bool,
    wifi_attempted: bool,
    wifi_next: usize,
    wifi_added: usize,
    wifi_failed: bool,
}

impl NetworkContext {
    pub fn new(profile: ActivationProfile) -> Self {
        Self {
            profile,
            ports: EthernetPorts::default(),
            ethernet_configured: false,
            wifi_attempted: false,
            wifi_next: 0,
            wifi_added: 0,
            wifi_failed: false,
        }
    }

    /// Status line, e.g. `Ethernet Configured. WiFi Failed.`
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.ethernet_configured {
            parts.push("Ethernet Configured.");
        }
        if self.wifi_attempted {
            parts.push(if self.wifi_failed { "WiFi Failed." } else { "WiFi Configured." });
        }
        parts.join(" ")
    }
}

type S = State<NetworkContext>;

pub fn machine() -> Machine<NetworkContext> {
    Machine::new(NAME, "ENUMERATE_ETHERNET_PORT_SETTINGS")
        .state(S::enumerate("ENUMERATE_ETHERNET_PORT_SETTINGS", ETHERNET_PORT_SETTINGS).then("PULL_ETHERNET_PORT_SETTINGS"))
        .state(
            S::pull("PULL_ETHERNET_PORT_SETTINGS", ETHERNET_PORT_SETTINGS, |c, items| {
                c.ports = EthernetPorts::from_items(&items);
                Ok(())
            })
            .when("hasWiredPort", |c| c.ports.wired.is_some(), "PUT_ETHERNET_PORT_SETTINGS")
            .then("CHECK_WIRELESS"),
        )
        .state(S::call("PUT_ETHERNET_PORT_SETTINGS", put_ethernet, check_ethernet).then("CHECK_WIRELESS"))
        .state(
            S::decide("CHECK_WIRELESS")
                .when("wantsWifi", wants_wifi, "REQUEST_WIFI_STATE_CHANGE")
                .then("SUCCESS"),
        )
        .state(
            S::call(
                "REQUEST_WIFI_STATE_CHANGE",
                |_, _| {
                    Ok(WsmanCall::invoke(
                        WIFI_PORT,
                        "RequestStateChange",
                        json!({ "RequestedState": WIFI_ENABLED_IN_S0 }),
                    ))
                },
                |c, envelope| {
                    c.wifi_attempted = true;
                    expect_zero(envelope, "RequestStateChange")
                },
            )
            .tolerate("MARK_WIFI_FAILED")
            .then("ADD_WIFI_SETTINGS"),
        )
        .state(S::task("ADD_WIFI_SETTINGS", add_wifi_settings).then("SUCCESS"))
        .state(S::task("MARK_WIFI_FAILED", mark_wifi_failed).then("SUCCESS"))
        .state(S::success("SUCCESS"))
}

/// Run as a child of activation, recording the `Network` status
pub async fn run(device: &mut Device, profile: &ActivationProfile) -> Result<()> {
    let mut ctx = NetworkContext::new(profile.clone());
    match machine().run(&mut ctx, device).await.into_result() {
        Ok(()) => {
            device.session.status.set(DeviceStatus::NETWORK, ctx.summary());
            Ok(())
        }
        Err(fault) => {
            device.session.status.set(DeviceStatus::NETWORK, fault.to_string());
            Err(fault)
        }
    }
}

fn put_ethernet(ctx: &NetworkContext, _: &DeviceSession) -> Result<WsmanCall> {
    let id = instance_id(&ctx.ports.wired, "wired ethernet")?;
    let current = ctx.ports.wired.clone().unwrap_or_default();
    let settings = with_fields(
        &current,
        json!({
            "DHCPEnabled": ctx.profile.dhcp_enabled,
            "IpSyncEnabled": true,
            "SharedStaticIp": false,
        }),
    );
    Ok(WsmanCall::put(ETHERNET_PORT_SETTINGS, settings).with_selector(Selector::new("InstanceID", id)))
}

fn check_ethernet(ctx: &mut NetworkContext, envelope: &Envelope) -> Result<()> {
    let settings = item(envelope, ETHERNET_PORT_SETTINGS)?;
    if let Some(dhcp) = as_bool(&settings["DHCPEnabled"]) {
        if dhcp != ctx.profile.dhcp_enabled {
            return Err(Fault::failed("Failed to configure Ethernet: DHCP setting was not applied"));
        }
    }
    ctx.ethernet_configured = true;
    Ok(())
}

fn wants_wifi(ctx: &NetworkContext) -> bool {
    ctx.ports.wireless.is_some() && !ctx.profile.wifi_profiles.is_empty()
}

fn mark_wifi_failed<'a>(ctx: &'a mut NetworkContext, _device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        ctx.wifi_attempted = true;
        ctx.wifi_failed = true;
        Ok(())
    })
}

/// Add every wireless profile in priority order. A profile that fails
/// marks Wi-Fi as failed and the rest are still attempted.
fn add_wifi_settings<'a>(ctx: &'a mut NetworkContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        ctx.wifi_attempted = true;
        while let Some(name) = ctx.profile.wifi_profiles.get(ctx.wifi_next).cloned() {
            let priority = ctx.wifi_next + 1;
            match add_wifi_profile(device, &name, priority).await {
                Ok(()) => {
                    ctx.wifi_added += 1;
                    info!(client_id = %device.client_id(), profile = %name, "Added wireless profile");
                }
                Err(fault) if fault.is_session_fault() => return Err(fault),
                Err(fault) => {
                    warn!(client_id = %device.client_id(), profile = %name, %fault, "Failed to add wireless profile");
                    ctx.wifi_failed = true;
                }
            }
            ctx.wifi_next += 1;
        }
        info!(client_id = %device.client_id(), added = ctx.wifi_added, failed = ctx.wifi_failed, "Wireless profiles processed");
        Ok(())
    })
}

async fn add_wifi_profile(device: &mut Device, name: &str, priority: usize) -> Result<()> {
    let services = device.services.clone();
    let wireless = services
        .profiles
        .get_wireless_profile(name)
        .await
        .map_err(|e| Fault::collaborator("profile source", e))?
        .ok_or_else(|| Fault::failed(format!("wireless profile {name} not found")))?;
    let passphrase = wireless_passphrase(services.secrets.as_ref(), name)
        .await
        .map_err(|e| Fault::collaborator("secret store", e))?
        .ok_or_else(|| Fault::failed(format!("no passphrase stored for wireless profile {name}")))?;

    let call = WsmanCall::invoke(
        WIFI_PORT_CONFIGURATION_SERVICE,
        "AddWiFiSettings",
        json!({
            "WiFiEndpoint": "WiFi Endpoint 0",
            "WiFiEndpointSettingsInput": wifi_endpoint_settings(&wireless, priority, &passphrase),
        }),
    );
    let envelope = device.call(&call).await?;
    expect_zero(&envelope, "AddWiFiSettings")
}

fn wifi_endpoint_settings(wireless: &WirelessProfile, priority: usize, passphrase: &str) -> Value {
    json!({
        "ElementName": wireless.name,
        "InstanceID": format!("Intel(r) AMT:WiFi Endpoint Settings {}", wireless.name),
        "SSID": wireless.ssid,
        "Priority": priority,
        "AuthenticationMethod": wireless.authentication_method,
        "EncryptionMethod": wireless.encryption_method,
        "PSKPassPhrase": passphrase,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rps_services::ActivationMode;

    #[test]
    fn test_machine_is_well_formed() {
        machine().validate().unwrap();
    }

    #[test]
    fn test_summary() {
        let mut ctx = NetworkContext::new(ActivationProfile::new("p", ActivationMode::Client));
        assert_eq!(ctx.summary(), "");
        ctx.ethernet_configured = true;
        assert_eq!(ctx.summary(), "Ethernet Configured.");
        ctx.wifi_attempted = true;
        assert_eq!(ctx.summary(), "Ethernet Configured. WiFi Configured.");
        ctx.wifi_failed = true;
        assert_eq!(ctx.summary(), "Ethernet Configured. WiFi Failed.");
    }

    #[test]
    fn test_wifi_only_with_port_and_profiles() {
        let profile = ActivationProfile::new("p", ActivationMode::Client).with_wifi_profile("home");
        let mut ctx = NetworkContext::new(profile);
        assert!(!wants_wifi(&ctx));
        ctx.ports.wireless = Some(json!({"InstanceID": "Intel(r) AMT Ethernet Port Settings 1"}));
        assert!(wants_wifi(&ctx));
    }

    #[test]
    fn test_wifi_endpoint_settings() {
        let wireless = WirelessProfile {
            name: "home".to_string(),
            ssid: "HomeNet".to_string(),
            authentication_method: 6,
            encryption_method: 4,
        };
        let settings = wifi_endpoint_settings(&wireless, 1, "secret-psk");
        assert_eq!(settings["SSID"], "HomeNet");
        assert_eq!(settings["Priority"], 1);
        assert_eq!(settings["InstanceID"], "Intel(r) AMT:WiFi Endpoint Settings home");
    }
}
