//! Workflow step tables
//!
//! Activation and deactivation are top-level; the others run as
//! children of activation. Each child records its own status key.

pub mod activation;
pub mod cira;
pub mod deactivation;
pub mod features;
pub mod network;
pub mod tls;
pub mod unconfiguration;

use crate::error::{Fault, Result};
use rps_wsman::{as_bool, Envelope};
use serde_json::Value;

pub(crate) const ETHERNET_PORT_SETTINGS: &str = "AMT_EthernetPortSettings";
pub(crate) const TLS_SETTING_DATA: &str = "AMT_TLSSettingData";
pub(crate) const SETUP_AND_CONFIGURATION_SERVICE: &str = "AMT_SetupAndConfigurationService";
pub(crate) const PUBLIC_KEY_MANAGEMENT_SERVICE: &str = "AMT_PublicKeyManagementService";
pub(crate) const ENVIRONMENT_DETECTION: &str = "AMT_EnvironmentDetectionSettingData";

const WIRED_INSTANCE: &str = "Intel(r) AMT Ethernet Port Settings 0";
const WIRELESS_INSTANCE: &str = "Intel(r) AMT Ethernet Port Settings 1";
const REMOTE_TLS_INSTANCE: &str = "Intel(r) AMT 802.3 TLS Settings";
const LOCAL_TLS_INSTANCE: &str = "Intel(r) AMT LMS TLS Settings";

/// Body element of a Get or Put response
pub(crate) fn item<'a>(envelope: &'a Envelope, class: &str) -> Result<&'a Value> {
    envelope
        .item(class)
        .ok_or_else(|| Fault::malformed(format!("response has no {class}")))
}

/// Body element of an invoke response
pub(crate) fn output<'a>(envelope: &'a Envelope, method: &str) -> Result<&'a Value> {
    envelope
        .output(method)
        .ok_or_else(|| Fault::malformed(format!("response has no {method}_OUTPUT")))
}

/// Copy of an instance with some fields replaced, for Put requests
pub(crate) fn with_fields(instance: &Value, fields: Value) -> Value {
    let mut merged = instance.as_object().cloned().unwrap_or_default();
    if let Value::Object(fields) = fields {
        merged.extend(fields);
    }
    Value::Object(merged)
}

/// String field of an instance
pub(crate) fn text<'a>(instance: &'a Value, field: &str) -> Option<&'a str> {
    instance[field].as_str().filter(|s| !s.is_empty())
}

/// String field of every pulled instance that has one
pub(crate) fn collect_field(items: &[Value], field: &str) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| text(item, field))
        .map(str::to_string)
        .collect()
}

/// Wired and wireless port settings out of an ethernet enumeration
#[derive(Debug, Clone, Default)]
pub(crate) struct EthernetPorts {
    pub wired: Option<Value>,
    pub wireless: Option<Value>,
}

impl EthernetPorts {
    pub fn from_items(items: &[Value]) -> Self {
        let mut ports = Self::default();
        for item in items {
            match text(item, "InstanceID") {
                Some(WIRED_INSTANCE) => ports.wired = Some(item.clone()),
                Some(WIRELESS_INSTANCE) => ports.wireless = Some(item.clone()),
                _ => {}
            }
        }
        ports
    }

    pub fn has_wired_mac(&self) -> bool {
        self.wired.as_ref().is_some_and(has_mac)
    }

    pub fn has_wireless_mac(&self) -> bool {
        self.wireless.as_ref().is_some_and(has_mac)
    }
}

fn has_mac(settings: &Value) -> bool {
    text(settings, "MACAddress").is_some_and(|mac| mac.chars().any(|c| c.is_ascii_hexdigit() && c != '0'))
}

/// The remote (802.3) and local (LMS) TLS setting instances
#[derive(Debug, Clone, Default)]
pub(crate) struct TlsSettings {
    pub remote: Option<Value>,
    pub local: Option<Value>,
}

impl TlsSettings {
    pub fn from_items(items: &[Value]) -> Self {
        let mut settings = Self::default();
        for item in items {
            match text(item, "InstanceID") {
                Some(REMOTE_TLS_INSTANCE) => settings.remote = Some(item.clone()),
                Some(LOCAL_TLS_INSTANCE) => settings.local = Some(item.clone()),
                _ => {}
            }
        }
        settings
    }

    pub fn any_enabled(&self) -> bool {
        [&self.remote, &self.local]
            .into_iter()
            .flatten()
            .any(|s| as_bool(&s["Enabled"]).unwrap_or(false))
    }
}

/// Instance ID of a setting pulled earlier
pub(crate) fn instance_id(instance: &Option<Value>, what: &str) -> Result<String> {
    instance
        .as_ref()
        .and_then(|i| text(i, "InstanceID"))
        .map(str::to_string)
        .ok_or_else(|| Fault::malformed(format!("no {what} instance")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ethernet_ports() {
        let items = vec![
            json!({"InstanceID": WIRED_INSTANCE, "MACAddress": "00-00-00-00-00-00"}),
            json!({"InstanceID": WIRELESS_INSTANCE, "MACAddress": "a4-bb-6d-89-52-e4"}),
        ];
        let ports = EthernetPorts::from_items(&items);
        assert!(!ports.has_wired_mac());
        assert!(ports.has_wireless_mac());
        assert!(ports.wired.is_some());
    }

    #[test]
    fn test_tls_settings() {
        let items = vec![
            json!({"InstanceID": REMOTE_TLS_INSTANCE, "Enabled": false}),
            json!({"InstanceID": LOCAL_TLS_INSTANCE, "Enabled": "true"}),
        ];
        let settings = TlsSettings::from_items(&items);
        assert!(settings.any_enabled());
        assert_eq!(instance_id(&settings.remote, "remote TLS").unwrap(), REMOTE_TLS_INSTANCE);
        assert!(instance_id(&None, "remote TLS").is_err());
    }

    #[test]
    fn test_with_fields() {
        let merged = with_fields(&json!({"A": 1, "B": 2}), json!({"B": 3}));
        assert_eq!(merged, json!({"A": 1, "B": 3}));
        assert_eq!(collect_field(&[json!({"Name": "x"}), json!({})], "Name"), vec!["x"]);
    }
}
