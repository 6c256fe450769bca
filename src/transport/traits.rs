use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::message::{
    DeliveryHandle, DeviceIdentity, EventRecord, FeedbackBatch, InboundMessage, OutboundMessage,
};
use crate::utils::error::TransportError;

/// Device-side channel to the hub, shared by the uplink publisher and the
/// downlink receiver. Implementations must allow a `receive` long-poll to run
/// concurrently with `send_event`.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Hands one device-to-cloud message to the hub; returns its message id
    /// once the hub has accepted it for queuing.
    async fn send_event(&self, message: OutboundMessage) -> Result<String, TransportError>;

    /// Waits up to `wait` for the next cloud-to-device message.
    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, TransportError>;

    /// Completes a received message so the hub stops redelivering it.
    async fn complete(&self, handle: &DeliveryHandle) -> Result<(), TransportError>;

    /// Stores `data` under `name` in the hub's blob container.
    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError>;
}

/// Opens authenticated device channels.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        endpoint: &str,
    ) -> Result<Arc<dyn DeviceTransport>, TransportError>;
}

/// Service-side endpoints of the hub: cloud-to-device sends, the feedback
/// queue and the partitioned telemetry stream.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn send_command(
        &self,
        device_id: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError>;

    /// Waits up to `wait` for pending feedback and locks it as one batch.
    /// Returns an empty batch when nothing arrived.
    async fn receive_feedback(&self, wait: Duration) -> Result<FeedbackBatch, TransportError>;

    async fn complete_feedback(&self, batch_id: &str) -> Result<(), TransportError>;

    async fn partition_ids(&self) -> Result<Vec<String>, TransportError>;

    /// Opens a reader on `partition_id` anchored at `since` and returns the
    /// first record it sees within `wait`.
    async fn read_partition(
        &self,
        partition_id: &str,
        since: DateTime<Utc>,
        wait: Duration,
    ) -> Result<Option<EventRecord>, TransportError>;
}
