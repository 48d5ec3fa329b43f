//! `rps serve`: the device channel
//!
//! Each WebSocket connection on `/activate` is one device. Inbound text
//! frames go to the session registry; the device's outbound queue is
//! drained onto the socket until either side closes.

use crate::config::RpsConfig;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use color_eyre::eyre::{Result, WrapErr};
use futures::{SinkExt, StreamExt};
use rps_certs::TlsCertificateIssuer;
use rps_services::{HttpMpsBroker, MemoryMpsBroker, MemorySecretStore, MpsBroker, SecretStore, VaultSecretStore};
use rps_workflow::{ChannelTransport, ClientMessage, ClientResponse, DeviceTransport, Services, SessionRegistry};
use rps_wsman::JsonEnvelopeCodec;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TLS_CA_NAME: &str = "RPS Device CA";

#[derive(Clone)]
struct AppState {
    transport: Arc<ChannelTransport>,
    registry: Arc<SessionRegistry>,
}

pub async fn run(config: RpsConfig) -> Result<()> {
    let services = build_services(&config).await?;
    let transport = Arc::new(ChannelTransport::new());
    let registry = Arc::new(SessionRegistry::new(
        transport.clone(),
        Arc::new(JsonEnvelopeCodec::new()),
        Arc::new(services),
    ));
    let app = router(AppState { transport, registry });

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .wrap_err_with(|| format!("cannot listen on {}", config.server.listen))?;
    info!(address = %listener.local_addr()?, "Device channel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")?;
    info!("Shutdown complete");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new().route("/activate", get(activate)).with_state(state)
}

/// Wire up the collaborators named in the config
pub async fn build_services(config: &RpsConfig) -> Result<Services> {
    let profiles = config.load_profiles().await?;

    let secrets: Arc<dyn SecretStore> = match &config.vault {
        Some(vault) => {
            info!(address = %vault.address, mount = %vault.mount, "Using Vault secret store");
            Arc::new(VaultSecretStore::new(vault.clone())?)
        }
        None => {
            warn!("No vault configured, device secrets are kept in memory");
            Arc::new(MemorySecretStore::new())
        }
    };

    let broker: Arc<dyn MpsBroker> = if config.mps.api_url.is_empty() {
        warn!("No MPS API configured, device registrations are kept in memory");
        Arc::new(MemoryMpsBroker::new())
    } else {
        Arc::new(HttpMpsBroker::new(config.mps.api_url.clone())?)
    };

    let tls_issuer = match &config.server.tls_ca_key {
        Some(path) => {
            let pem = tokio::fs::read_to_string(path)
                .await
                .wrap_err_with(|| format!("cannot read CA key {}", path.display()))?;
            TlsCertificateIssuer::from_key_pem(TLS_CA_NAME, &pem)?
        }
        None => TlsCertificateIssuer::generate(TLS_CA_NAME)?,
    };

    Ok(Services {
        profiles: Arc::new(profiles),
        secrets,
        broker,
        tls_issuer: Arc::new(tls_issuer),
        engine: config.engine.clone(),
        mps: config.mps.clone(),
    })
}

async fn activate(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let mut outbound = state.transport.connect(&client_id).await;
    let (mut sink, mut stream) = socket.split();
    info!(client_id = %client_id, "Device connected");

    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(client_id = %writer_id, error = %e, "Cannot encode outbound message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(client_id = %writer_id, error = %e, "Socket closed while sending");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientMessage::parse(text.as_str()) {
                Ok(message) => {
                    if let Err(e) = state.registry.dispatch(&client_id, message).await {
                        warn!(client_id = %client_id, error = %e, "Failed to handle device message");
                    }
                }
                Err(fault) => {
                    warn!(client_id = %client_id, %fault, "Unreadable device message");
                    let reply = ClientResponse::error_message(&fault.to_string());
                    if let Err(e) = state.transport.send(&client_id, reply).await {
                        debug!(client_id = %client_id, error = %e, "Cannot reply to device");
                    }
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Socket error");
                break;
            }
        }
    }

    close_connection(&state, &client_id).await;
    writer.abort();
    info!(client_id = %client_id, "Device disconnected");
}

/// Outbound queue first, then the session; later sends fail with a transport fault
async fn close_connection(state: &AppState, client_id: &str) {
    state.transport.disconnect(client_id).await;
    state.registry.disconnect(client_id).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
