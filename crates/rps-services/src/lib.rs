//! External collaborators for the provisioning workflows
//!
//! Each collaborator is an async trait with an HTTP-backed
//! implementation for production and an in-memory one for tests and
//! single-node setups.

pub mod broker;
pub mod error;
pub mod passwords;
pub mod profiles;
pub mod secrets;

pub use broker::{DeviceRegistration, HttpMpsBroker, MemoryMpsBroker, MpsBroker};
pub use error::{Result, ServiceError};
pub use passwords::{generate_password, is_strong_password, GENERATED_PASSWORD_LEN};
pub use profiles::{
    ActivationMode, ActivationProfile, CiraProfile, DomainProfile, MemoryProfileSource, Password,
    ProfileCatalogue, ProfileSource, TlsMode, UserConsent, WirelessProfile,
};
pub use secrets::{
    wireless_passphrase, DeviceSecrets, MemorySecretStore, SecretStore, VaultConfig,
    VaultSecretStore,
};
