//! Device channel messages
//!
//! The device-side client wraps everything in a small JSON envelope.
//! Activation and deactivation requests carry a base64 JSON payload
//! describing the device; responses carry the base64 raw HTTP response
//! AMT returned for the last WS-Man request.

use crate::error::{Fault, Result};
use base64::prelude::*;
use rps_services::Password;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: &str = "4.0.0";

/// What the device is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMethod {
    Activation,
    Deactivation,
    Response,
    Maintenance,
}

/// Inbound message from a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub method: ClientMethod,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub payload: String,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Fault::malformed(format!("invalid client message: {e}")))
    }

    /// Decoded payload bytes
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        BASE64_STANDARD
            .decode(self.payload.trim())
            .map_err(|e| Fault::malformed(format!("payload is not base64: {e}")))
    }

    /// Payload of an activation or deactivation request
    pub fn activation_payload(&self) -> Result<ActivationPayload> {
        let bytes = self.payload_bytes()?;
        serde_json::from_slice(&bytes).map_err(|e| Fault::malformed(format!("invalid activation payload: {e}")))
    }
}

/// Device description sent with activation and deactivation requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivationPayload {
    pub ver: String,
    pub build: String,
    pub sku: String,
    pub uuid: String,
    pub username: String,
    pub password: Option<Password>,
    /// 0 pre-provisioning, 1 client control mode, 2 admin control mode
    pub current_mode: u8,
    pub hostname: String,
    pub fqdn: String,
    pub client: String,
    pub cert_hashes: Vec<String>,
    pub profile: String,
    pub friendly_name: Option<String>,
}

/// What the server sends to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMethod {
    Wsman,
    Success,
    Error,
    HeartbeatRequest,
}

/// Outbound message to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    pub method: ResponseMethod,
    pub api_key: String,
    pub app_version: String,
    pub protocol_version: String,
    pub status: String,
    pub message: String,
    pub payload: String,
}

impl ClientResponse {
    fn new(method: ResponseMethod, status: &str, message: String, payload: String) -> Self {
        Self {
            method,
            api_key: String::new(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            status: status.to_string(),
            message,
            payload,
        }
    }

    /// Raw HTTP request for the device to relay to AMT
    pub fn wsman(request: &str) -> Self {
        Self::new(
            ResponseMethod::Wsman,
            "ok",
            "ok".to_string(),
            BASE64_STANDARD.encode(request),
        )
    }

    /// Terminal success carrying the status map
    pub fn success(status: &DeviceStatus) -> Self {
        Self::new(ResponseMethod::Success, "success", status.to_json(), String::new())
    }

    /// Terminal failure carrying the status map
    pub fn error(status: &DeviceStatus) -> Self {
        Self::new(ResponseMethod::Error, "failed", status.to_json(), String::new())
    }

    /// Rejection that never started a workflow
    pub fn error_message(message: &str) -> Self {
        let mut status = DeviceStatus::default();
        status.set(DeviceStatus::STATUS, message);
        Self::error(&status)
    }

    pub fn heartbeat() -> Self {
        Self::new(ResponseMethod::HeartbeatRequest, "ok", String::new(), String::new())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Fault::malformed(e.to_string()))
    }

    /// Decoded raw HTTP request of a `wsman` message
    pub fn request_text(&self) -> Result<String> {
        let bytes = BASE64_STANDARD
            .decode(&self.payload)
            .map_err(|e| Fault::malformed(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| Fault::malformed(e.to_string()))
    }
}

/// Per-subsystem outcome strings reported to the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus(BTreeMap<String, String>);

impl DeviceStatus {
    pub const STATUS: &'static str = "Status";
    pub const NETWORK: &'static str = "Network";
    pub const CIRA: &'static str = "CIRAConnection";
    pub const TLS: &'static str = "TLSConfiguration";
    pub const FEATURES: &'static str = "Features";

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}
