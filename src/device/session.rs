use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::message::DeviceIdentity;
use crate::transport::{DeviceConnector, DeviceTransport};
use crate::utils::error::ConnectError;

/// An open, authenticated connection for one device.
///
/// Cheap to clone; every clone shares the same transport handle.
#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn DeviceTransport>,
    device_id: String,
    endpoint: String,
    opened_at: DateTime<Utc>,
}

impl Session {
    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("endpoint", &self.endpoint)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

/// Owns the current session of a device and is shared by the publisher and
/// the receiver.
///
/// `open` replaces the current session without draining it: operations
/// already running on the previous handle carry on independently. Stop a
/// running `DownlinkReceiver` before re-opening, the receive loop keeps the
/// handle it was started with.
pub struct TransportSession {
    connector: Arc<dyn DeviceConnector>,
    current: RwLock<Option<Session>>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
        }
    }

    /// Connects `identity` to `endpoint`. Not retried on failure.
    pub async fn open(
        &self,
        identity: DeviceIdentity,
        endpoint: &str,
    ) -> Result<Session, ConnectError> {
        if identity.device_id.trim().is_empty() {
            return Err(ConnectError::MissingField("device id"));
        }
        if identity.symmetric_key.trim().is_empty() {
            return Err(ConnectError::MissingField("device key"));
        }
        if endpoint.trim().is_empty() {
            return Err(ConnectError::MissingField("endpoint"));
        }

        let transport = self
            .connector
            .connect(&identity, endpoint)
            .await
            .map_err(|source| {
                warn!(device_id = %identity.device_id, endpoint, error = %source, "connect failed");
                ConnectError::Transport {
                    endpoint: endpoint.to_string(),
                    source,
                }
            })?;

        let session = Session {
            transport,
            device_id: identity.device_id,
            endpoint: endpoint.to_string(),
            opened_at: Utc::now(),
        };

        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session.clone());
        if let Some(previous) = previous {
            info!(
                device_id = %previous.device_id,
                "previous session replaced"
            );
        }
        info!(device_id = %session.device_id, endpoint, "session opened");
        Ok(session)
    }

    /// The session most recently opened, if any.
    pub fn current(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// Forgets the current session. Clones still held elsewhere stay usable.
    pub fn close(&self) -> Option<Session> {
        let closed = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = &closed {
            info!(device_id = %session.device_id, "session closed");
        }
        closed
    }
}
