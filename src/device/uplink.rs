use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::device::session::TransportSession;
use crate::message::{Ack, AckLevel, OutboundMessage};
use crate::utils::error::SendError;

/// Sends device-to-cloud messages over the current session.
///
/// One call sends one message. Nothing is retried and there is no
/// idempotency key, so a caller that retries may produce duplicates.
pub struct UplinkPublisher {
    session: Arc<TransportSession>,
}

impl UplinkPublisher {
    pub fn new(session: Arc<TransportSession>) -> Self {
        Self { session }
    }

    /// Returns once the hub has accepted `message` for queuing.
    pub async fn publish(&self, message: OutboundMessage) -> Result<Ack, SendError> {
        let session = self.session.current().ok_or(SendError::NotOpen)?;
        let message_id = message.message_id().to_string();
        let size = message.len();

        match session.transport().send_event(message).await {
            Ok(accepted_id) => {
                debug!(
                    device_id = session.device_id(),
                    message_id = %accepted_id,
                    size,
                    "message published"
                );
                Ok(Ack {
                    message_id: accepted_id,
                    accepted_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!(
                    device_id = session.device_id(),
                    message_id = %message_id,
                    error = %e,
                    "publish failed"
                );
                Err(e.into())
            }
        }
    }

    /// Serializes `body` as JSON and publishes it with the given ack level.
    pub async fn publish_json<T: Serialize>(
        &self,
        body: &T,
        ack: AckLevel,
    ) -> Result<Ack, SendError> {
        let message =
            OutboundMessage::json(body).map_err(|e| SendError::Invalid(e.to_string()))?;
        self.publish(message.with_ack(ack)).await
    }

    /// Reads `reader` to the end and stores it as blob `name` with a single
    /// upload call. Returns the number of bytes uploaded.
    pub async fn upload_blob<R>(&self, name: &str, mut reader: R) -> Result<usize, SendError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if name.trim().is_empty() {
            return Err(SendError::Invalid("blob name must not be empty".to_string()));
        }
        let session = self.session.current().ok_or(SendError::NotOpen)?;

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| SendError::Invalid(format!("failed to read blob stream: {e}")))?;
        let size = data.len();

        session
            .transport()
            .upload_blob(name, data)
            .await
            .map_err(SendError::from)?;
        info!(device_id = session.device_id(), blob = name, size, "blob uploaded");
        Ok(size)
    }
}
