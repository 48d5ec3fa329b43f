//! Per-device session state and the WS-Man round trip

use crate::config::{EngineConfig, MpsConfig};
use crate::engine::WorkflowEvent;
use crate::error::{Fault, Result};
use crate::messages::{ActivationPayload, ClientResponse, DeviceStatus};
use crate::pending::PendingCallRegistry;
use rps_certs::{ProvisioningCertificateChain, TlsCertificateIssuer};
use rps_services::{ActivationMode, MpsBroker, ProfileSource, SecretStore};
use rps_wsman::{ConnectionParams, DigestChallenge, Envelope, HttpResponse, MessageBuilder, WsmanCall};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// AMT's plain-HTTP WS-Man port
pub const AMT_PORT: u16 = 16992;
/// AMT's TLS WS-Man port
pub const AMT_TLS_PORT: u16 = 16993;

/// State owned by one device's workflow run
#[derive(Debug)]
pub struct DeviceSession {
    pub client_id: String,
    pub payload: ActivationPayload,
    pub connection: ConnectionParams,
    pub activation_mode: Option<ActivationMode>,
    /// Held in memory only for the duration of an admin activation
    pub certificate_chain: Option<ProvisioningCertificateChain>,
    pub status: DeviceStatus,
    message_id: u64,
    unauthorized_count: u32,
}

impl DeviceSession {
    pub fn new(client_id: impl Into<String>, payload: ActivationPayload) -> Self {
        let password = payload
            .password
            .as_ref()
            .map(|p| p.expose().to_string())
            .unwrap_or_default();
        let connection = ConnectionParams::new("localhost", AMT_PORT, payload.username.clone(), password);
        Self {
            client_id: client_id.into(),
            payload,
            connection,
            activation_mode: None,
            certificate_chain: None,
            status: DeviceStatus::default(),
            message_id: 0,
            unauthorized_count: 0,
        }
    }

    /// Device GUID as reported by the client
    pub fn uuid(&self) -> &str {
        &self.payload.uuid
    }

    pub fn next_message_id(&mut self) -> u64 {
        self.message_id += 1;
        self.message_id
    }

    /// Count one more unauthorized response and return the new total
    pub fn record_unauthorized(&mut self, challenge: Option<DigestChallenge>) -> u32 {
        self.unauthorized_count += 1;
        if let Some(challenge) = challenge {
            self.connection.set_challenge(challenge);
        }
        self.unauthorized_count
    }

    pub fn reset_unauthorized(&mut self) {
        self.unauthorized_count = 0;
    }

    pub fn unauthorized_count(&self) -> u32 {
        self.unauthorized_count
    }
}

/// Shared collaborators every workflow can reach
pub struct Services {
    pub profiles: Arc<dyn ProfileSource>,
    pub secrets: Arc<dyn SecretStore>,
    pub broker: Arc<dyn MpsBroker>,
    pub tls_issuer: Arc<TlsCertificateIssuer>,
    pub engine: EngineConfig,
    pub mps: MpsConfig,
}

/// A device session bound to the machinery that reaches the device
pub struct Device {
    pub session: DeviceSession,
    pub services: Arc<Services>,
    pending: Arc<PendingCallRegistry>,
    codec: Arc<dyn MessageBuilder>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl Device {
    pub fn new(
        session: DeviceSession,
        services: Arc<Services>,
        pending: Arc<PendingCallRegistry>,
        codec: Arc<dyn MessageBuilder>,
        events: broadcast::Sender<WorkflowEvent>,
    ) -> Self {
        Self {
            session,
            services,
            pending,
            codec,
            events,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.session.client_id
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.services.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// One WS-Man round trip through the device.
    ///
    /// HTTP and SOAP level failures come back as typed faults; a clean
    /// response clears the unauthorized counter.
    pub async fn call(&mut self, call: &WsmanCall) -> Result<Envelope> {
        let message_id = self.session.next_message_id();
        let body = self
            .codec
            .build(call, message_id)
            .map_err(|e| Fault::failed(format!("cannot encode {call}: {e}")))?;
        let request = self
            .session
            .connection
            .frame_request(&body, self.codec.content_type());

        debug!(client_id = %self.session.client_id, %call, message_id, "Sending WS-Man request");
        let raw = self
            .pending
            .invoke(&self.session.client_id, ClientResponse::wsman(&request))
            .await?;

        let response = HttpResponse::parse(&raw).map_err(|e| Fault::malformed(e.to_string()))?;
        if response.status == 401 {
            let challenge = response
                .www_authenticate()
                .and_then(|header| DigestChallenge::parse(header).ok());
            return Err(Fault::Unauthorized { challenge });
        }

        if !response.is_success() {
            let fault = self
                .codec
                .parse(&response.body)
                .ok()
                .and_then(|envelope| envelope.soap_fault());
            return Err(match fault {
                Some(fault) => Fault::Soap {
                    status: response.status,
                    fault,
                },
                None if response.status == 400 => Fault::BadRequest,
                None => Fault::Http(response.status),
            });
        }

        let envelope = self
            .codec
            .parse(&response.body)
            .map_err(|e| Fault::malformed(format!("{call}: {e}")))?;
        if let Some(fault) = envelope.soap_fault() {
            return Err(Fault::Soap {
                status: response.status,
                fault,
            });
        }

        self.session.reset_unauthorized();
        Ok(envelope)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::ChannelTransport;
    use rps_services::{MemoryMpsBroker, MemoryProfileSource, MemorySecretStore};
    use rps_wsman::JsonEnvelopeCodec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) fn services() -> Services {
        Services {
            profiles: Arc::new(MemoryProfileSource::new()),
            secrets: Arc::new(MemorySecretStore::new()),
            broker: Arc::new(MemoryMpsBroker::new()),
            tls_issuer: Arc::new(TlsCertificateIssuer::generate("Test CA").unwrap()),
            engine: EngineConfig::default(),
            mps: MpsConfig::default(),
        }
    }

    /// A device wired to a channel transport, with the raw outbound queue
    pub(crate) async fn device(
        client_id: &str,
    ) -> (Device, Arc<PendingCallRegistry>, mpsc::UnboundedReceiver<ClientResponse>) {
        let transport = Arc::new(ChannelTransport::new());
        let rx = transport.connect(client_id).await;
        let pending = Arc::new(PendingCallRegistry::new(transport, Duration::from_secs(5)));
        let (events, _) = broadcast::channel(64);
        let device = Device::new(
            DeviceSession::new(client_id, ActivationPayload::default()),
            Arc::new(services()),
            pending.clone(),
            Arc::new(JsonEnvelopeCodec::new()),
            events,
        );
        (device, pending, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http(status: &str, headers: &str, body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 {status}\r\n{headers}Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    async fn round_trip(raw: Vec<u8>) -> (Result<Envelope>, Device) {
        let (mut device, pending, mut rx) = testing::device("dev-1").await;
        let responder = tokio::spawn(async move {
            rx.recv().await.unwrap();
            pending.resolve("dev-1", raw).await;
        });
        let result = device.call(&WsmanCall::get("AMT_GeneralSettings")).await;
        responder.await.unwrap();
        (result, device)
    }

    #[test]
    fn test_session_counters() {
        let mut session = DeviceSession::new("dev-1", ActivationPayload::default());
        assert_eq!(session.next_message_id(), 1);
        assert_eq!(session.next_message_id(), 2);

        assert_eq!(session.record_unauthorized(None), 1);
        assert_eq!(session.record_unauthorized(None), 2);
        session.reset_unauthorized();
        assert_eq!(session.unauthorized_count(), 0);
        assert_eq!(session.connection.port, AMT_PORT);
    }

    #[tokio::test]
    async fn test_success_resets_unauthorized() {
        let body = json!({"Envelope": {"Header": {}, "Body": {"AMT_GeneralSettings": {"DigestRealm": "x"}}}});
        let (mut device, pending, mut rx) = testing::device("dev-1").await;
        device.session.record_unauthorized(None);

        let raw = http("200 OK", "", &body.to_string());
        let responder = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap();
            assert!(sent.request_text().unwrap().starts_with("POST /wsman HTTP/1.1"));
            pending.resolve("dev-1", raw).await;
        });
        let envelope = device.call(&WsmanCall::get("AMT_GeneralSettings")).await.unwrap();
        responder.await.unwrap();

        assert_eq!(envelope.item("AMT_GeneralSettings").unwrap()["DigestRealm"], "x");
        assert_eq!(device.session.unauthorized_count(), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_carries_challenge() {
        let raw = http(
            "401 Unauthorized",
            "WWW-Authenticate: Digest realm=\"Digest:A3829B3827DE4D33D4449B366831FD01\", nonce=\"abc\", qop=\"auth\"\r\n",
            "",
        );
        let (result, _) = round_trip(raw).await;
        match result {
            Err(Fault::Unauthorized { challenge: Some(challenge) }) => assert_eq!(challenge.nonce, "abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_classification() {
        let (result, _) = round_trip(http("400 Bad Request", "", "")).await;
        assert!(matches!(result, Err(Fault::BadRequest)));

        let (result, _) = round_trip(http("500 Internal Server Error", "", "")).await;
        assert!(matches!(result, Err(Fault::Http(500))));

        let fault = json!({"Envelope": {"Body": {"Fault": {
            "Code": {"Value": "a:Sender", "Subcode": {"Value": "a:DestinationUnreachable"}},
            "Reason": {"Text": "No route can be determined to reach the destination role defined by the WS-Addressing To."}
        }}}});
        let (result, _) = round_trip(http("400 Bad Request", "", &fault.to_string())).await;
        let err = result.unwrap_err();
        assert!(err.is_not_found());

        let (result, _) = round_trip(http("200 OK", "", "<not json>")).await;
        assert!(matches!(result, Err(Fault::Malformed(_))));

        let (result, _) = round_trip(b"garbage".to_vec()).await;
        assert!(matches!(result, Err(Fault::Malformed(_))));
    }
}
