//! Secret store for device and profile credentials
//!
//! Device passwords are kept under `devices/<guid>`, wireless
//! passphrases under `wireless/<profile>`.

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Key/value secret storage
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the secret at `path`, `None` if absent
    async fn get_secret(&self, path: &str) -> Result<Option<Value>>;

    /// Create or replace the secret at `path`
    async fn write_secret(&self, path: &str, data: &Value) -> Result<()>;

    /// Remove the secret at `path`; absent secrets are not an error
    async fn delete_secret(&self, path: &str) -> Result<()>;
}

/// Credentials persisted per provisioned device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSecrets {
    #[serde(rename = "AMT_PASSWORD", skip_serializing_if = "Option::is_none")]
    pub amt_password: Option<String>,
    #[serde(rename = "MEBX_PASSWORD", skip_serializing_if = "Option::is_none")]
    pub mebx_password: Option<String>,
    #[serde(rename = "MPS_PASSWORD", skip_serializing_if = "Option::is_none")]
    pub mps_password: Option<String>,
}

impl DeviceSecrets {
    pub fn path(guid: &str) -> String {
        format!("devices/{guid}")
    }

    pub async fn load(store: &dyn SecretStore, guid: &str) -> Result<Option<Self>> {
        match store.get_secret(&Self::path(guid)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ServiceError::Parse(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn save(&self, store: &dyn SecretStore, guid: &str) -> Result<()> {
        let value = serde_json::to_value(self).map_err(|e| ServiceError::Parse(e.to_string()))?;
        store.write_secret(&Self::path(guid), &value).await
    }
}

/// Passphrase of a WPA/WPA2-PSK wireless profile
pub async fn wireless_passphrase(store: &dyn SecretStore, profile: &str) -> Result<Option<String>> {
    let secret = store.get_secret(&format!("wireless/{profile}")).await?;
    Ok(secret.and_then(|v| v["PSK_PASSPHRASE"].as_str().map(str::to_string)))
}

/// Connection settings for a HashiCorp Vault KV v2 mount
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub address: String,
    pub token: String,
    pub mount: String,
    pub prefix: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8200".to_string(),
            token: String::new(),
            mount: "secret".to_string(),
            prefix: "rps".to_string(),
        }
    }
}

impl VaultConfig {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Vault KV v2 over HTTP
pub struct VaultSecretStore {
    client: reqwest::Client,
    config: VaultConfig,
}

impl VaultSecretStore {
    pub fn new(config: VaultConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(ServiceError::InvalidConfig("vault address is empty".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }

    fn url(&self, kind: &str, path: &str) -> String {
        let base = self.config.address.trim_end_matches('/');
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{base}/v1/{}/{kind}/{path}", self.config.mount)
        } else {
            format!("{base}/v1/{}/{kind}/{prefix}/{path}", self.config.mount)
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ServiceError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn get_secret(&self, path: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(self.url("data", path))
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(path = %path, "Secret not found");
            return Ok(None);
        }

        let body: Value = Self::check(response).await?.json().await?;
        match &body["data"]["data"] {
            Value::Null => Ok(None),
            data => Ok(Some(data.clone())),
        }
    }

    async fn write_secret(&self, path: &str, data: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.url("data", path))
            .header("X-Vault-Token", &self.config.token)
            .json(&json!({ "data": data }))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(path = %path, "Wrote secret");
        Ok(())
    }

    async fn delete_secret(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url("metadata", path))
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        debug!(path = %path, "Deleted secret");
        Ok(())
    }
}

/// In-process secret store
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Value>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.secrets.read().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.secrets.read().await.get(path).cloned())
    }

    async fn write_secret(&self, path: &str, data: &Value) -> Result<()> {
        self.secrets
            .write()
            .await
            .insert(path.to_string(), data.clone());
        Ok(())
    }

    async fn delete_secret(&self, path: &str) -> Result<()> {
        self.secrets.write().await.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vault(server: &MockServer) -> VaultSecretStore {
        VaultSecretStore::new(
            VaultConfig::default()
                .with_address(server.uri())
                .with_token("root"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_vault_get_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/rps/devices/1234"))
            .and(header("X-Vault-Token", "root"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "data": { "AMT_PASSWORD": "P@ssw0rd" }, "metadata": { "version": 1 } }
            })))
            .mount(&server)
            .await;

        let store = vault(&server);
        let secrets = DeviceSecrets::load(&store, "1234").await.unwrap().unwrap();
        assert_eq!(secrets.amt_password.as_deref(), Some("P@ssw0rd"));
        assert!(secrets.mebx_password.is_none());
    }

    #[tokio::test]
    async fn test_vault_missing_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = vault(&server);
        assert!(store.get_secret("devices/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vault_write_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/rps/devices/abcd"))
            .and(body_json(json!({ "data": { "AMT_PASSWORD": "a", "MPS_PASSWORD": "b" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "version": 1 } })))
            .expect(1)
            .mount(&server)
            .await;

        let store = vault(&server);
        let secrets = DeviceSecrets {
            amt_password: Some("a".to_string()),
            mebx_password: None,
            mps_password: Some("b".to_string()),
        };
        secrets.save(&store, "abcd").await.unwrap();
    }

    #[tokio::test]
    async fn test_vault_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Vault is sealed"))
            .mount(&server)
            .await;

        let store = vault(&server);
        let err = store.write_secret("devices/x", &json!({})).await.unwrap_err();
        match err {
            ServiceError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "Vault is sealed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_vault_delete_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/secret/metadata/rps/devices/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = vault(&server);
        store.delete_secret("devices/gone").await.unwrap();
    }

    #[test]
    fn test_vault_requires_address() {
        let config = VaultConfig::default().with_address("");
        assert!(VaultSecretStore::new(config).is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySecretStore::new();
        store
            .write_secret("wireless/home", &json!({ "PSK_PASSPHRASE": "hunter22" }))
            .await
            .unwrap();
        assert_eq!(
            wireless_passphrase(&store, "home").await.unwrap().as_deref(),
            Some("hunter22")
        );
        assert!(wireless_passphrase(&store, "office").await.unwrap().is_none());

        store.delete_secret("wireless/home").await.unwrap();
        assert!(store.is_empty().await);
    }
}
