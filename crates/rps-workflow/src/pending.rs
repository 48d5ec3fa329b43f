//! Pending call registry
//!
//! Bridges "send a request to the device and wait for its answer" onto
//! the device channel, where answers arrive later as unrelated inbound
//! messages. At most one call may be outstanding per client id.

use crate::error::{Fault, Result};
use crate::messages::ClientResponse;
use crate::transport::DeviceTransport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

type Reply = Result<Vec<u8>>;

/// One outstanding call awaiting the device's response
#[derive(Debug)]
struct PendingCall {
    correlation_id: Uuid,
    created_at: DateTime<Utc>,
    reply: oneshot::Sender<Reply>,
}

/// Outstanding calls keyed by client id
pub struct PendingCallRegistry {
    transport: Arc<dyn DeviceTransport>,
    calls: Mutex<HashMap<String, PendingCall>>,
    timeout: Duration,
}

impl PendingCallRegistry {
    pub fn new(transport: Arc<dyn DeviceTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            calls: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Send a message and wait for the device's raw response.
    ///
    /// Fails with [`Fault::AlreadyPending`] without sending anything if
    /// a call is already outstanding for the client.
    pub async fn invoke(&self, client_id: &str, message: ClientResponse) -> Result<Vec<u8>> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        {
            let mut calls = self.calls.lock().await;
            if calls.contains_key(client_id) {
                return Err(Fault::AlreadyPending(client_id.to_string()));
            }
            calls.insert(
                client_id.to_string(),
                PendingCall {
                    correlation_id,
                    created_at: Utc::now(),
                    reply: tx,
                },
            );
        }
        debug!(client_id = %client_id, %correlation_id, "Call registered");

        if let Err(e) = self.transport.send(client_id, message).await {
            self.remove_if(client_id, correlation_id).await;
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Fault::Disconnected),
            Err(_) => {
                self.remove_if(client_id, correlation_id).await;
                warn!(client_id = %client_id, %correlation_id, "Call timed out");
                Err(Fault::Timeout(self.timeout))
            }
        }
    }

    /// Deliver a device response. Returns false when nothing was pending.
    pub async fn resolve(&self, client_id: &str, response: Vec<u8>) -> bool {
        self.complete(client_id, Ok(response)).await
    }

    /// Fail the outstanding call. Returns false when nothing was pending.
    pub async fn reject(&self, client_id: &str, fault: Fault) -> bool {
        self.complete(client_id, Err(fault)).await
    }

    /// The device went away; wake its outstanding call, if any
    pub async fn disconnect(&self, client_id: &str) {
        if self.reject(client_id, Fault::Disconnected).await {
            debug!(client_id = %client_id, "Rejected pending call on disconnect");
        }
    }

    pub async fn is_pending(&self, client_id: &str) -> bool {
        self.calls.lock().await.contains_key(client_id)
    }

    async fn complete(&self, client_id: &str, reply: Reply) -> bool {
        let call = self.calls.lock().await.remove(client_id);
        match call {
            Some(call) => {
                let waited = Utc::now() - call.created_at;
                debug!(
                    client_id = %client_id,
                    correlation_id = %call.correlation_id,
                    waited_ms = waited.num_milliseconds(),
                    ok = reply.is_ok(),
                    "Call completed"
                );
                // The waiter may have timed out in the meantime
                let _ = call.reply.send(reply);
                true
            }
            None => {
                warn!(client_id = %client_id, "Response without a pending call");
                false
            }
        }
    }

    async fn remove_if(&self, client_id: &str, correlation_id: Uuid) {
        let mut calls = self.calls.lock().await;
        if calls
            .get(client_id)
            .is_some_and(|call| call.correlation_id == correlation_id)
        {
            calls.remove(client_id);
        }
    }
}
