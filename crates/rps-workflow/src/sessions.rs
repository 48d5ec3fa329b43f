//! Inbound routing of device messages
//!
//! The [`SessionRegistry`] owns the live sessions keyed by client id.
//! Activation and deactivation requests start a workflow on its own
//! task; responses are handed to the pending call of that client.

use crate::device::{Device, DeviceSession, Services};
use crate::engine::{Outcome, WorkflowEvent};
use crate::error::Result;
use crate::messages::{ActivationPayload, ClientMessage, ClientMethod, ClientResponse};
use crate::pending::PendingCallRegistry;
use crate::transport::DeviceTransport;
use crate::workflows::{activation, deactivation};
use chrono::{DateTime, Utc};
use rps_wsman::MessageBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MAINTENANCE_UNSUPPORTED: &str = "maintenance is not supported by this server";
pub const SESSION_IN_PROGRESS: &str = "a workflow is already running for this device";

/// Top-level workflow a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Activation,
    Deactivation,
}

impl SessionKind {
    fn name(self) -> &'static str {
        match self {
            SessionKind::Activation => activation::NAME,
            SessionKind::Deactivation => deactivation::NAME,
        }
    }
}

#[derive(Debug)]
struct LiveSession {
    token: Uuid,
    kind: SessionKind,
    started_at: DateTime<Utc>,
}

/// Live device sessions and the machinery they share
pub struct SessionRegistry {
    transport: Arc<dyn DeviceTransport>,
    pending: Arc<PendingCallRegistry>,
    codec: Arc<dyn MessageBuilder>,
    services: Arc<Services>,
    sessions: Mutex<HashMap<String, LiveSession>>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn DeviceTransport>, codec: Arc<dyn MessageBuilder>, services: Arc<Services>) -> Self {
        let pending = Arc::new(PendingCallRegistry::new(
            transport.clone(),
            services.engine.call_timeout(),
        ));
        let (events, _) = broadcast::channel(1024);
        Self {
            transport,
            pending,
            codec,
            services,
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Workflow events of every session
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn pending(&self) -> &Arc<PendingCallRegistry> {
        &self.pending
    }

    pub async fn is_active(&self, client_id: &str) -> bool {
        self.sessions.lock().await.contains_key(client_id)
    }

    /// Route one inbound message
    pub async fn dispatch(self: &Arc<Self>, client_id: &str, message: ClientMessage) -> Result<()> {
        match message.method {
            ClientMethod::Activation => self.start(client_id, SessionKind::Activation, &message).await,
            ClientMethod::Deactivation => self.start(client_id, SessionKind::Deactivation, &message).await,
            ClientMethod::Response => {
                let delivered = match message.payload_bytes() {
                    Ok(response) => self.pending.resolve(client_id, response).await,
                    Err(fault) => self.pending.reject(client_id, fault).await,
                };
                if !delivered {
                    warn!(client_id = %client_id, "Dropped unsolicited response");
                }
                Ok(())
            }
            ClientMethod::Maintenance => {
                info!(client_id = %client_id, "Rejecting maintenance request");
                self.transport
                    .send(client_id, ClientResponse::error_message(MAINTENANCE_UNSUPPORTED))
                    .await
            }
        }
    }

    /// The device's connection closed
    pub async fn disconnect(&self, client_id: &str) {
        self.pending.disconnect(client_id).await;
        if let Some(session) = self.sessions.lock().await.remove(client_id) {
            let elapsed = Utc::now() - session.started_at;
            info!(
                client_id = %client_id,
                workflow = session.kind.name(),
                elapsed_ms = elapsed.num_milliseconds(),
                "Device disconnected during workflow"
            );
        }
    }

    async fn start(self: &Arc<Self>, client_id: &str, kind: SessionKind, message: &ClientMessage) -> Result<()> {
        let payload = match message.activation_payload() {
            Ok(payload) => payload,
            Err(fault) => {
                warn!(client_id = %client_id, %fault, "Rejecting request");
                return self
                    .transport
                    .send(client_id, ClientResponse::error_message(&fault.to_string()))
                    .await;
            }
        };

        let token = Uuid::new_v4();
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(live) = sessions.get(client_id) {
                warn!(client_id = %client_id, running = live.kind.name(), "Rejecting request for busy device");
                drop(sessions);
                return self
                    .transport
                    .send(client_id, ClientResponse::error_message(SESSION_IN_PROGRESS))
                    .await;
            }
            sessions.insert(
                client_id.to_string(),
                LiveSession {
                    token,
                    kind,
                    started_at: Utc::now(),
                },
            );
        }

        info!(client_id = %client_id, uuid = %payload.uuid, workflow = kind.name(), "Starting session");
        let registry = Arc::clone(self);
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            registry.run_session(client_id, token, kind, payload).await;
        });
        Ok(())
    }

    async fn run_session(&self, client_id: String, token: Uuid, kind: SessionKind, payload: ActivationPayload) {
        let mut device = Device::new(
            DeviceSession::new(client_id.clone(), payload),
            self.services.clone(),
            self.pending.clone(),
            self.codec.clone(),
            self.events.clone(),
        );

        let outcome = match kind {
            SessionKind::Activation => activation::run(&mut device).await,
            SessionKind::Deactivation => deactivation::run(&mut device).await,
        };

        {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(&client_id).is_some_and(|live| live.token == token) {
                sessions.remove(&client_id);
            }
        }

        let status = &device.session.status;
        let message = match &outcome {
            Outcome::Success => ClientResponse::success(status),
            Outcome::Failed(_) => ClientResponse::error(status),
        };
        if let Err(e) = self.transport.send(&client_id, message).await {
            error!(client_id = %client_id, error = %e, "Failed to deliver final status");
        }
        info!(
            client_id = %client_id,
            workflow = kind.name(),
            success = outcome.is_success(),
            status = %status.to_json(),
            "Session finished"
        );
    }
}
