//! Provisioning profiles
//!
//! Profiles are read-only configuration the workflows consult: the
//! activation profile a device asks for, and the CIRA, wireless and
//! domain records it references. They come from a [`ProfileSource`];
//! [`MemoryProfileSource`] holds a catalogue loaded from TOML.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// A password from configuration; never printed
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Admin control mode or client control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    Admin,
    Client,
}

/// User consent requirement for redirection sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserConsent {
    None,
    Kvm,
    #[default]
    All,
}

impl UserConsent {
    /// `IPS_OptInService.OptInRequired` value
    pub fn opt_in_required(self) -> u32 {
        match self {
            UserConsent::None => 0,
            UserConsent::Kvm => 1,
            UserConsent::All => 4_294_967_295,
        }
    }
}

/// AMT TLS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Server authentication only
    Server,
    /// Server authentication, plain HTTP still allowed
    ServerAndNonTls,
    /// Mutual authentication
    Mutual,
    /// Mutual authentication, plain HTTP still allowed
    MutualAndNonTls,
}

impl TlsMode {
    pub fn value(self) -> u8 {
        match self {
            TlsMode::Server => 1,
            TlsMode::ServerAndNonTls => 2,
            TlsMode::Mutual => 3,
            TlsMode::MutualAndNonTls => 4,
        }
    }

    pub fn accepts_non_secure(self) -> bool {
        matches!(self, TlsMode::ServerAndNonTls | TlsMode::MutualAndNonTls)
    }

    pub fn mutual_authentication(self) -> bool {
        matches!(self, TlsMode::Mutual | TlsMode::MutualAndNonTls)
    }
}

fn default_true() -> bool {
    true
}

/// What a device gets provisioned with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationProfile {
    pub name: String,
    pub activation: ActivationMode,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub amt_password: Option<Password>,
    #[serde(default)]
    pub mebx_password: Option<Password>,
    #[serde(default)]
    pub generate_random_password: bool,
    #[serde(default)]
    pub generate_random_mebx_password: bool,
    /// Name of the CIRA configuration; when absent TLS is configured instead
    #[serde(default)]
    pub cira_config: Option<String>,
    #[serde(default)]
    pub tls_mode: Option<TlsMode>,
    #[serde(default = "default_true")]
    pub dhcp_enabled: bool,
    /// Wireless profile names, highest priority first
    #[serde(default)]
    pub wifi_profiles: Vec<String>,
    #[serde(default)]
    pub user_consent: UserConsent,
    #[serde(default = "default_true")]
    pub ider_enabled: bool,
    #[serde(default = "default_true")]
    pub kvm_enabled: bool,
    #[serde(default = "default_true")]
    pub sol_enabled: bool,
    #[serde(default)]
    pub tenant_id: String,
}

impl ActivationProfile {
    pub fn new(name: impl Into<String>, activation: ActivationMode) -> Self {
        Self {
            name: name.into(),
            activation,
            tags: Vec::new(),
            amt_password: None,
            mebx_password: None,
            generate_random_password: false,
            generate_random_mebx_password: false,
            cira_config: None,
            tls_mode: None,
            dhcp_enabled: true,
            wifi_profiles: Vec::new(),
            user_consent: UserConsent::default(),
            ider_enabled: true,
            kvm_enabled: true,
            sol_enabled: true,
            tenant_id: String::new(),
        }
    }

    pub fn with_amt_password(mut self, password: impl Into<String>) -> Self {
        self.amt_password = Some(Password::new(password));
        self
    }

    pub fn with_mebx_password(mut self, password: impl Into<String>) -> Self {
        self.mebx_password = Some(Password::new(password));
        self
    }

    pub fn with_cira_config(mut self, name: impl Into<String>) -> Self {
        self.cira_config = Some(name.into());
        self
    }

    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = Some(mode);
        self
    }

    pub fn with_wifi_profile(mut self, name: impl Into<String>) -> Self {
        self.wifi_profiles.push(name.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// `AMT_RedirectionService.RequestStateChange` value for IDER/SOL
    pub fn redirection_state(&self) -> u32 {
        match (self.ider_enabled, self.sol_enabled) {
            (false, false) => 32768,
            (true, false) => 32769,
            (false, true) => 32770,
            (true, true) => 32771,
        }
    }
}

fn default_mps_port() -> u16 {
    4433
}

/// CIRA tunnel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiraProfile {
    pub name: String,
    pub mps_server_address: String,
    #[serde(default = "default_mps_port")]
    pub mps_port: u16,
    pub username: String,
    /// Fixed tunnel password; generated per device when absent
    #[serde(default)]
    pub password: Option<Password>,
    pub common_name: String,
    /// Base64 DER of the MPS trust root; falls back to the server-wide one
    #[serde(default)]
    pub mps_root_certificate: Option<String>,
    #[serde(default)]
    pub tenant_id: String,
}

impl CiraProfile {
    /// `AddMpServer` InfoFormat: 3 IPv4, 4 IPv6, 201 FQDN
    pub fn address_format(&self) -> u8 {
        match self.mps_server_address.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => 3,
            Ok(IpAddr::V6(_)) => 4,
            Err(_) => 201,
        }
    }
}

/// WPA/WPA2 personal wireless network; the passphrase lives in the secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirelessProfile {
    pub name: String,
    pub ssid: String,
    /// 4 WPA-PSK, 6 WPA2-PSK
    pub authentication_method: u8,
    /// 3 TKIP, 4 CCMP
    pub encryption_method: u8,
}

/// Provisioning certificate for a DNS domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainProfile {
    pub name: String,
    pub suffix: String,
    /// Base64 PKCS#12
    pub provisioning_cert: String,
    pub provisioning_cert_password: Password,
}

/// Read-only profile lookups
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn get_profile(&self, name: &str) -> Result<Option<ActivationProfile>>;

    async fn get_cira_config(&self, name: &str) -> Result<Option<CiraProfile>>;

    async fn get_wireless_profile(&self, name: &str) -> Result<Option<WirelessProfile>>;

    /// Domain whose suffix matches the device FQDN (longest match wins)
    async fn find_domain(&self, fqdn: &str) -> Result<Option<DomainProfile>>;
}

/// Profile catalogue file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCatalogue {
    pub profiles: Vec<ActivationProfile>,
    pub cira_configs: Vec<CiraProfile>,
    pub wireless_profiles: Vec<WirelessProfile>,
    pub domains: Vec<DomainProfile>,
}

/// Profiles held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryProfileSource {
    catalogue: ProfileCatalogue,
}

impl MemoryProfileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let catalogue: ProfileCatalogue = toml::from_str(input)?;
        Ok(Self { catalogue })
    }

    /// Load a TOML catalogue from disk
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let source = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            profiles = source.catalogue.profiles.len(),
            domains = source.catalogue.domains.len(),
            "Loaded profile catalogue"
        );
        Ok(source)
    }

    pub fn catalogue(&self) -> &ProfileCatalogue {
        &self.catalogue
    }

    pub fn with_profile(mut self, profile: ActivationProfile) -> Self {
        self.catalogue.profiles.push(profile);
        self
    }

    pub fn with_cira_config(mut self, cira: CiraProfile) -> Self {
        self.catalogue.cira_configs.push(cira);
        self
    }

    pub fn with_wireless_profile(mut self, wireless: WirelessProfile) -> Self {
        self.catalogue.wireless_profiles.push(wireless);
        self
    }

    pub fn with_domain(mut self, domain: DomainProfile) -> Self {
        self.catalogue.domains.push(domain);
        self
    }
}

#[async_trait]
impl ProfileSource for MemoryProfileSource {
    async fn get_profile(&self, name: &str) -> Result<Option<ActivationProfile>> {
        Ok(self.catalogue.profiles.iter().find(|p| p.name == name).cloned())
    }

    async fn get_cira_config(&self, name: &str) -> Result<Option<CiraProfile>> {
        Ok(self.catalogue.cira_configs.iter().find(|c| c.name == name).cloned())
    }

    async fn get_wireless_profile(&self, name: &str) -> Result<Option<WirelessProfile>> {
        Ok(self
            .catalogue
            .wireless_profiles
            .iter()
            .find(|w| w.name == name)
            .cloned())
    }

    async fn find_domain(&self, fqdn: &str) -> Result<Option<DomainProfile>> {
        let fqdn = fqdn.trim_end_matches('.').to_ascii_lowercase();
        Ok(self
            .catalogue
            .domains
            .iter()
            .filter(|d| {
                let suffix = d.suffix.trim_start_matches('.').to_ascii_lowercase();
                fqdn == suffix || fqdn.ends_with(&format!(".{suffix}"))
            })
            .max_by_key(|d| d.suffix.len())
            .cloned())
    }
}
