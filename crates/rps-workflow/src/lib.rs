//! Per-device protocol workflows for Intel AMT provisioning
//!
//! Each connected device gets a [`DeviceSession`] driven through a step
//! table by the [`engine`]. WS-Man requests go out over the device
//! channel and the [`PendingCallRegistry`] parks the workflow until the
//! matching response comes back through [`SessionRegistry::dispatch`].

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod messages;
pub mod pending;
pub mod recovery;
pub mod sessions;
pub mod transport;
pub mod workflows;

pub use config::{EngineConfig, MpsConfig};
pub use device::{Device, DeviceSession, Services, AMT_PORT, AMT_TLS_PORT};
pub use engine::{Machine, Outcome, State, Step, WorkflowEvent};
pub use error::{Fault, Result};
pub use messages::{
    ActivationPayload, ClientMessage, ClientMethod, ClientResponse, DeviceStatus, ResponseMethod,
};
pub use pending::PendingCallRegistry;
pub use recovery::{recover, Expected, OnError, Resolution};
pub use sessions::{SessionRegistry, MAINTENANCE_UNSUPPORTED, SESSION_IN_PROGRESS};
pub use transport::{ChannelTransport, DeviceTransport};
