//! Workflow engine and MPS settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unauthorized responses tolerated in a row before a workflow fails
    pub max_unauthorized_retries: u32,
    /// How long to wait for the device to answer a call
    pub call_timeout_secs: u64,
    /// Re-sends allowed when the device returns an unparseable response
    pub malformed_retries: u32,
    /// Settle time between activation and using the new credentials
    pub activation_settle_ms: u64,
    /// Settle time after committing TLS changes
    pub tls_settle_ms: u64,
    /// Digest user once AMT is activated
    pub admin_username: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_unauthorized_retries: 3,
            call_timeout_secs: 60,
            malformed_retries: 2,
            activation_settle_ms: 5000,
            tls_settle_ms: 5000,
            admin_username: "admin".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn activation_settle(&self) -> Duration {
        Duration::from_millis(self.activation_settle_ms)
    }

    pub fn tls_settle(&self) -> Duration {
        Duration::from_millis(self.tls_settle_ms)
    }

    pub fn with_max_unauthorized_retries(mut self, max: u32) -> Self {
        self.max_unauthorized_retries = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_malformed_retries(mut self, retries: u32) -> Self {
        self.malformed_retries = retries;
        self
    }
}

/// Management Presence Server settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MpsConfig {
    /// Base URL of the MPS REST API
    pub api_url: String,
    /// Base64 DER of the MPS trust root, used when a CIRA profile has none
    pub root_certificate: String,
}

impl MpsConfig {
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_root_certificate(mut self, cert: impl Into<String>) -> Self {
        self.root_certificate = cert.into();
        self
    }
}
