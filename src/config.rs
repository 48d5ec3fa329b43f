//! `rps.toml` loading

use color_eyre::eyre::{Result, WrapErr};
use rps_services::{MemoryProfileSource, VaultConfig};
use rps_workflow::{EngineConfig, MpsConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "rps.toml";

/// Device channel listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// PKCS#8 PEM key of the CA that signs device TLS certificates;
    /// a throwaway CA is generated when unset
    pub tls_ca_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            tls_ca_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpsConfig {
    pub engine: EngineConfig,
    pub mps: MpsConfig,
    /// Secrets stay in memory when no vault is configured
    pub vault: Option<VaultConfig>,
    /// TOML profile catalogue
    pub profiles: Option<PathBuf>,
    pub server: ServerConfig,
}

impl RpsConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).wrap_err("invalid configuration")
    }

    /// Read the config file; a missing default file means all defaults
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config = Self::from_toml_str(&content)
                    .wrap_err_with(|| format!("in {}", path.display()))?;
                info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && path == Path::new(DEFAULT_CONFIG_PATH) => {
                warn!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).wrap_err_with(|| format!("cannot read {}", path.display())),
        }
    }

    pub async fn load_profiles(&self) -> Result<MemoryProfileSource> {
        match &self.profiles {
            Some(path) => MemoryProfileSource::load(path)
                .await
                .wrap_err_with(|| format!("cannot load profile catalogue {}", path.display())),
            None => {
                warn!("No profile catalogue configured; every activation will fail");
                Ok(MemoryProfileSource::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RpsConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.engine.max_unauthorized_retries, 3);
        assert_eq!(config.engine.admin_username, "admin");
        assert!(config.vault.is_none());
        assert!(config.mps.api_url.is_empty());
    }

    #[test]
    fn test_sections() {
        let config = RpsConfig::from_toml_str(
            r#"
            profiles = "/etc/rps/profiles.toml"

            [engine]
            call_timeout_secs = 30
            tls_settle_ms = 100

            [mps]
            api_url = "http://mps:3000"

            [vault]
            address = "http://vault:8200"
            token = "root"

            [server]
            listen = "127.0.0.1:9000"
            tls_ca_key = "/etc/rps/ca.key"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.call_timeout_secs, 30);
        assert_eq!(config.engine.malformed_retries, 2);
        assert_eq!(config.mps.api_url, "http://mps:3000");
        let vault = config.vault.unwrap();
        assert_eq!(vault.token, "root");
        assert_eq!(vault.mount, "secret");
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.tls_ca_key, Some(PathBuf::from("/etc/rps/ca.key")));
        assert_eq!(config.profiles, Some(PathBuf::from("/etc/rps/profiles.toml")));
    }

    #[test]
    fn test_unknown_types_rejected() {
        assert!(RpsConfig::from_toml_str("[engine]\ncall_timeout_secs = \"soon\"").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:8181\"").unwrap();
        let config = RpsConfig::load(file.path()).await.unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8181");
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_an_error() {
        assert!(RpsConfig::load(Path::new("/nonexistent/rps.toml")).await.is_err());
    }
}
