//! A scripted AMT device behind the channel transport

#![allow(dead_code)]

use base64::prelude::*;
use rps_certs::{CertificateChainBuilder, TlsCertificateIssuer};
use rps_services::{
    ActivationMode, ActivationProfile, CiraProfile, DomainProfile, MemoryMpsBroker, MemoryProfileSource,
    MemorySecretStore, Password, WirelessProfile,
};
use rps_workflow::{
    ChannelTransport, ClientMessage, ClientResponse, EngineConfig, MpsConfig, ResponseMethod, Services,
    SessionRegistry, WorkflowEvent,
};
use rps_wsman::{Action, JsonEnvelopeCodec, WsmanCall};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub const PFX: &str = include_str!("../../../rps-certs/tests/fixtures/provisioning.pfx.b64");
pub const PFX_PASSWORD: &str = "P@ssw0rd";
pub const ROOT_SHA256: &str = "5358b024931bd06aa171dd8d258d0ff8dcfe1aa9c326bb6c254688fba2d35ce1";
pub const VALID_REALM: &str = "Digest:A3829B3827DE4D33D4449B366831FD01";
pub const DEVICE_UUID: &str = "4c4c4544-004d-4d10-8050-b3c04f325133";
pub const CLIENT_ID: &str = "dev-1";

const WIRED_INSTANCE: &str = "Intel(r) AMT Ethernet Port Settings 0";
const WIRELESS_INSTANCE: &str = "Intel(r) AMT Ethernet Port Settings 1";
const KEY_PAIR_INSTANCE: &str = "Intel(r) AMT Key: Handle: 0";

/// In-memory AMT answering decoded WS-Man calls
pub struct FakeAmt {
    pub singletons: HashMap<String, Value>,
    pub instances: HashMap<String, Vec<Value>>,
    pub return_values: HashMap<String, i64>,
    /// 401 responses still to hand out before accepting requests
    pub unauthorized: u32,
    /// Every accepted call, as `Class.Action`
    pub calls: Vec<String>,
    device_public_key: String,
}

impl FakeAmt {
    /// A pre-provisioning device with a wired port and no wireless
    pub fn new() -> Self {
        let mut amt = Self {
            singletons: HashMap::new(),
            instances: HashMap::new(),
            return_values: HashMap::new(),
            unauthorized: 1,
            calls: Vec::new(),
            device_public_key: device_public_key(),
        };
        amt.singletons.insert(
            "AMT_GeneralSettings".into(),
            json!({ "DigestRealm": VALID_REALM, "HostName": "amt-host" }),
        );
        amt.singletons.insert(
            "IPS_HostBasedSetupService".into(),
            json!({ "ConfigurationNonce": BASE64_STANDARD.encode([7u8; 20]), "CurrentControlMode": 0 }),
        );
        amt.singletons.insert(
            "AMT_RedirectionService".into(),
            json!({ "EnabledState": 32768, "ListenerEnabled": false }),
        );
        amt.singletons.insert("CIM_KVMRedirectionSAP".into(), json!({ "EnabledState": 3 }));
        amt.singletons.insert("IPS_OptInService".into(), json!({ "OptInRequired": 4294967295u32 }));
        amt.singletons.insert(
            "AMT_EnvironmentDetectionSettingData".into(),
            json!({ "InstanceID": "Intel(r) AMT Environment Detection Settings", "DetectionStrings": [] }),
        );
        amt.instances.insert(
            "AMT_EthernetPortSettings".into(),
            vec![json!({ "InstanceID": WIRED_INSTANCE, "MACAddress": "a4-bb-6d-89-52-e4", "DHCPEnabled": true })],
        );
        amt.instances.insert(
            "AMT_TLSSettingData".into(),
            vec![
                json!({ "InstanceID": "Intel(r) AMT 802.3 TLS Settings", "Enabled": false }),
                json!({ "InstanceID": "Intel(r) AMT LMS TLS Settings", "Enabled": false }),
            ],
        );
        amt
    }

    /// Only a wireless port, with stale endpoint settings on it
    pub fn wifi_only(mut self, endpoints: usize) -> Self {
        self.instances.insert(
            "AMT_EthernetPortSettings".into(),
            vec![
                json!({ "InstanceID": WIRED_INSTANCE, "MACAddress": "00-00-00-00-00-00" }),
                json!({ "InstanceID": WIRELESS_INSTANCE, "MACAddress": "a4-bb-6d-89-52-e5" }),
            ],
        );
        let settings = (0..endpoints)
            .map(|i| json!({ "InstanceID": format!("Intel(r) AMT:WiFi Endpoint Settings old-{i}") }))
            .collect();
        self.instances.insert("CIM_WiFiEndpointSettings".into(), settings);
        self
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.singletons
            .insert("AMT_GeneralSettings".into(), json!({ "DigestRealm": realm }));
        self
    }

    pub fn with_return_value(mut self, method: &str, value: i64) -> Self {
        self.return_values.insert(method.to_string(), value);
        self
    }

    pub fn with_unauthorized(mut self, count: u32) -> Self {
        self.unauthorized = count;
        self
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }

    /// Answer one raw HTTP request with a raw HTTP response
    pub fn respond(&mut self, request: &str) -> Vec<u8> {
        if self.unauthorized > 0 {
            self.unauthorized -= 1;
            return http(
                "401 Unauthorized",
                "WWW-Authenticate: Digest realm=\"Digest:A3829B3827DE4D33D4449B366831FD01\", nonce=\"f2b1c8\", qop=\"auth\"\r\n",
                "",
            );
        }

        let body = request.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default();
        let (call, _) = JsonEnvelopeCodec::new()
            .decode_request(body)
            .expect("request decodes");
        self.calls.push(call.to_string());

        match call.action.clone() {
            Action::Get => match self.singletons.get(&call.class) {
                Some(value) => ok(json!({ call.class.clone(): value })),
                None => not_found(),
            },
            Action::Put => {
                if self.singletons.contains_key(&call.class) {
                    self.singletons.insert(call.class.clone(), call.body.clone());
                }
                ok(json!({ call.class.clone(): call.body }))
            }
            Action::Create => {
                self.instances
                    .entry(call.class.clone())
                    .or_default()
                    .push(call.body.clone());
                ok(json!({ "ResourceCreated": {} }))
            }
            Action::Delete => self.delete(&call),
            Action::Enumerate => ok(json!({
                "EnumerateResponse": { "EnumerationContext": format!("ctx-{}", call.class) }
            })),
            Action::Pull { .. } => {
                let items = self.instances.get(&call.class).cloned().unwrap_or_default();
                ok(json!({ "PullResponse": { "Items": { call.class.clone(): items } } }))
            }
            Action::Invoke { method } => self.invoke(&method, &call.body),
        }
    }

    fn delete(&mut self, call: &WsmanCall) -> Vec<u8> {
        let Some(selector) = &call.selector else {
            return not_found();
        };
        let items = self.instances.entry(call.class.clone()).or_default();
        match items.iter().position(|i| i[&selector.name] == selector.value.as_str()) {
            Some(index) => {
                items.remove(index);
                ok(json!({}))
            }
            None if call.class == "AMT_RemoteAccessPolicyRule" => http("400 Bad Request", "", ""),
            None => not_found(),
        }
    }

    fn invoke(&mut self, method: &str, body: &Value) -> Vec<u8> {
        let mut output = json!({ "ReturnValue": self.return_values.get(method).copied().unwrap_or(0) });
        match method {
            "AddMpServer" => output["MpServer"] = reference("AMT_ManagementPresenceRemoteSAP", "Name", "Intel(r) AMT:Management Presence Server 0"),
            "AddRemoteAccessPolicyRule" => output["PolicyRule"] = reference("AMT_RemoteAccessPolicyRule", "PolicyRuleName", "User Initiated"),
            "GenerateKeyPair" => {
                output["KeyPair"] = reference("AMT_PublicPrivateKeyPair", "InstanceID", KEY_PAIR_INSTANCE);
                self.instances
                    .entry("AMT_PublicPrivateKeyPair".into())
                    .or_default()
                    .push(json!({ "InstanceID": KEY_PAIR_INSTANCE, "DERKey": self.device_public_key }));
            }
            "AddCertificate" => output["CreatedCertificate"] = reference("AMT_PublicKeyCertificate", "InstanceID", "Intel(r) AMT Certificate: Handle: 1"),
            "GetLowAccuracyTimeSynch" => output["Ta0"] = json!(1_700_000_000),
            "AddWiFiSettings" => self
                .instances
                .entry("CIM_WiFiEndpointSettings".into())
                .or_default()
                .push(body["WiFiEndpointSettingsInput"].clone()),
            _ => {}
        }
        ok(json!({ format!("{method}_OUTPUT"): output }))
    }
}

fn reference(class: &str, name: &str, value: &str) -> Value {
    json!({
        "Address": "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
        "ReferenceParameters": {
            "ResourceURI": format!("http://intel.com/wbem/wscim/1/amt-schema/1/{class}"),
            "SelectorSet": { "Selector": { "Name": name, "Value": value } }
        }
    })
}

fn http(status: &str, headers: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\n{headers}Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn ok(body: Value) -> Vec<u8> {
    http("200 OK", "", &json!({ "Body": body }).to_string())
}

fn not_found() -> Vec<u8> {
    let fault = json!({
        "Body": {
            "Fault": {
                "Code": { "Value": "a:Sender", "Subcode": { "Value": "a:DestinationUnreachable" } },
                "Reason": { "Text": "No route can be determined to reach the destination role" }
            }
        }
    });
    http("400 Bad Request", "", &fault.to_string())
}

/// PKCS#1 public key of the fixture key, standing in for a key AMT generated
fn device_public_key() -> String {
    let chain = CertificateChainBuilder::build(PFX, PFX_PASSWORD).expect("fixture pfx");
    let private = RsaPrivateKey::from_pkcs8_der(chain.private_key.expect("fixture key").der()).expect("rsa key");
    let der = RsaPublicKey::from(&private).to_pkcs1_der().expect("pkcs1");
    BASE64_STANDARD.encode(der.as_bytes())
}

pub fn domain() -> DomainProfile {
    DomainProfile {
        name: "vprodemo".to_string(),
        suffix: "vprodemo.com".to_string(),
        provisioning_cert: PFX.trim().to_string(),
        provisioning_cert_password: Password::new(PFX_PASSWORD),
    }
}

pub fn cira_config() -> CiraProfile {
    CiraProfile {
        name: "mps".to_string(),
        mps_server_address: "mps.vprodemo.com".to_string(),
        mps_port: 4433,
        username: "mpsadmin".to_string(),
        password: None,
        common_name: "mps.vprodemo.com".to_string(),
        mps_root_certificate: Some(BASE64_STANDARD.encode(b"mps root")),
        tenant_id: String::new(),
    }
}

pub fn admin_profile() -> ActivationProfile {
    ActivationProfile::new("acm", ActivationMode::Admin)
        .with_amt_password("Amt-P@ssw0rd1")
        .with_mebx_password("Mebx-P@ssw0rd1")
}

pub fn wireless_profile(name: &str, ssid: &str) -> WirelessProfile {
    WirelessProfile {
        name: name.to_string(),
        ssid: ssid.to_string(),
        authentication_method: 6,
        encryption_method: 4,
    }
}

pub fn activation_payload(profile: &str) -> Value {
    json!({
        "ver": "16.1.25",
        "build": "2050",
        "sku": "16392",
        "uuid": DEVICE_UUID,
        "username": "$$OsAdmin",
        "password": "Lms-P@ssw0rd1",
        "currentMode": 0,
        "hostname": "amt-host",
        "fqdn": "amt-host.vprodemo.com",
        "client": "RPC",
        "certHashes": [ROOT_SHA256],
        "profile": profile,
    })
}

/// A session registry wired to one connected device
pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub transport: Arc<ChannelTransport>,
    pub broker: Arc<MemoryMpsBroker>,
    pub secrets: Arc<MemorySecretStore>,
    events: broadcast::Receiver<WorkflowEvent>,
    rx: mpsc::UnboundedReceiver<ClientResponse>,
}

impl Harness {
    pub async fn new(profiles: MemoryProfileSource) -> Self {
        Self::with_engine(profiles, EngineConfig::default()).await
    }

    pub async fn with_engine(profiles: MemoryProfileSource, engine: EngineConfig) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let rx = transport.connect(CLIENT_ID).await;
        let broker = Arc::new(MemoryMpsBroker::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let services = Services {
            profiles: Arc::new(profiles),
            secrets: secrets.clone(),
            broker: broker.clone(),
            tls_issuer: Arc::new(TlsCertificateIssuer::generate("Test Device CA").expect("issuer")),
            engine,
            mps: MpsConfig::default(),
        };
        let registry = Arc::new(SessionRegistry::new(
            transport.clone(),
            Arc::new(JsonEnvelopeCodec::new()),
            Arc::new(services),
        ));
        let events = registry.subscribe();
        Self {
            registry,
            transport,
            broker,
            secrets,
            events,
            rx,
        }
    }

    /// Deliver a device request such as `activation`
    pub async fn send(&self, method: &str, payload: &Value) {
        let message = json!({
            "method": method,
            "apiKey": "key",
            "appVersion": "2.0.0",
            "protocolVersion": "4.0.0",
            "status": "ok",
            "message": "ok",
            "payload": BASE64_STANDARD.encode(payload.to_string()),
        });
        let message = ClientMessage::parse(&message.to_string()).expect("client message");
        self.registry.dispatch(CLIENT_ID, message).await.expect("dispatch");
    }

    /// Next wsman request text, answering nothing
    pub async fn next_request(&mut self) -> ClientResponse {
        self.rx.recv().await.expect("device channel open")
    }

    /// Relay requests to the fake until a terminal message arrives
    pub async fn run(&mut self, amt: &mut FakeAmt) -> ClientResponse {
        loop {
            let message = self.rx.recv().await.expect("device channel open");
            match message.method {
                ResponseMethod::Wsman => {
                    let request = message.request_text().expect("request text");
                    let raw = amt.respond(&request);
                    let reply = json!({ "method": "response", "payload": BASE64_STANDARD.encode(raw) });
                    let reply = ClientMessage::parse(&reply.to_string()).expect("response message");
                    self.registry.dispatch(CLIENT_ID, reply).await.expect("dispatch");
                }
                ResponseMethod::HeartbeatRequest => {}
                ResponseMethod::Success | ResponseMethod::Error => return message,
            }
        }
    }

    /// States entered since the last call, as `workflow/STATE`
    pub fn states(&mut self) -> Vec<String> {
        let mut states = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let WorkflowEvent::StateEntered { workflow, state, .. } = event {
                states.push(format!("{workflow}/{state}"));
            }
        }
        states
    }
}

/// Status map carried by a terminal message
pub fn status(message: &ClientResponse) -> BTreeMap<String, String> {
    serde_json::from_str(&message.message).expect("status map")
}
