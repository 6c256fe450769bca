use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::message::{Ack, OutboundMessage};
use crate::transport::ServiceTransport;
use crate::utils::error::SendError;

/// Sends cloud-to-device commands through the hub's service endpoint.
///
/// The ack level of each message decides which feedback records the hub
/// produces for it.
pub struct CommandSender {
    service: Arc<dyn ServiceTransport>,
}

impl CommandSender {
    pub fn new(service: Arc<dyn ServiceTransport>) -> Self {
        Self { service }
    }

    pub async fn send(&self, device_id: &str, message: OutboundMessage) -> Result<Ack, SendError> {
        if device_id.trim().is_empty() {
            return Err(SendError::Invalid("device id must not be empty".to_string()));
        }
        let ack = message.ack();
        match self.service.send_command(device_id, message).await {
            Ok(message_id) => {
                debug!(device_id, message_id = %message_id, ack = ?ack, "command queued");
                Ok(Ack {
                    message_id,
                    accepted_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!(device_id, error = %e, "command send failed");
                Err(e.into())
            }
        }
    }
}
