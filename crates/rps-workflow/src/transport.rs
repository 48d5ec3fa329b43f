//! Outbound side of the device channel

use crate::error::{Fault, Result};
use crate::messages::ClientResponse;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Delivers messages to connected devices
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Send one message to a device
    async fn send(&self, client_id: &str, message: ClientResponse) -> Result<()>;
}

/// Transport backed by one unbounded channel per connected device.
///
/// Whatever owns the real connection drains the receiver returned by
/// [`ChannelTransport::connect`] and writes to the socket.
#[derive(Default)]
pub struct ChannelTransport {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<ClientResponse>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and get the receiving end of its outbound queue
    pub async fn connect(&self, client_id: &str) -> mpsc::UnboundedReceiver<ClientResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(client_id.to_string(), tx);
        debug!(client_id = %client_id, "Device connected");
        rx
    }

    pub async fn disconnect(&self, client_id: &str) {
        if self.peers.write().await.remove(client_id).is_some() {
            debug!(client_id = %client_id, "Device disconnected");
        }
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.peers.read().await.contains_key(client_id)
    }
}

#[async_trait]
impl DeviceTransport for ChannelTransport {
    async fn send(&self, client_id: &str, message: ClientResponse) -> Result<()> {
        let peers = self.peers.read().await;
        let tx = peers
            .get(client_id)
            .ok_or_else(|| Fault::Transport(format!("no connection for {client_id}")))?;
        tx.send(message)
            .map_err(|_| Fault::Transport(format!("connection closed for {client_id}")))
    }
}
