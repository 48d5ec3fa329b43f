//! Remote-access broker (MPS) registration

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Device record the broker needs to accept its CIRA tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub guid: String,
    pub hostname: String,
    #[serde(rename = "mpsusername")]
    pub mps_username: String,
    pub tags: Vec<String>,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_suffix: Option<String>,
}

/// MPS device inventory
#[async_trait]
pub trait MpsBroker: Send + Sync {
    /// Register a device
    async fn register(&self, device: &DeviceRegistration) -> Result<()>;

    /// Forget a device; unknown devices are not an error
    async fn unregister(&self, guid: &str) -> Result<()>;
}

/// MPS REST API client
pub struct HttpMpsBroker {
    client: reqwest::Client,
    api_url: String,
}

impl HttpMpsBroker {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        let api_url = api_url.into();
        if api_url.is_empty() {
            return Err(ServiceError::InvalidConfig("MPS api url is empty".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MpsBroker for HttpMpsBroker {
    async fn register(&self, device: &DeviceRegistration) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/v1/devices", self.api_url))
            .json(device)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(guid = %device.guid, status = status.as_u16(), "MPS rejected device registration");
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(guid = %device.guid, "Registered device with MPS");
        Ok(())
    }

    async fn unregister(&self, guid: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/v1/devices/{guid}", self.api_url))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            debug!(guid = %guid, "Removed device from MPS");
            return Ok(());
        }

        Err(ServiceError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

/// In-process broker that remembers registrations
#[derive(Default)]
pub struct MemoryMpsBroker {
    devices: RwLock<Vec<DeviceRegistration>>,
}

impl MemoryMpsBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn devices(&self) -> Vec<DeviceRegistration> {
        self.devices.read().await.clone()
    }
}

#[async_trait]
impl MpsBroker for MemoryMpsBroker {
    async fn register(&self, device: &DeviceRegistration) -> Result<()> {
        let mut devices = self.devices.write().await;
        devices.retain(|d| d.guid != device.guid);
        devices.push(device.clone());
        Ok(())
    }

    async fn unregister(&self, guid: &str) -> Result<()> {
        self.devices.write().await.retain(|d| d.guid != guid);
        Ok(())
    }
}
