//! The `message` module defines the data exchanged with the hub.
//!
//! - `OutboundMessage`: an immutable payload with a delivery-acknowledgement
//!   level, consumed by exactly one send call.
//! - `InboundMessage`: a cloud-to-device message together with the delivery
//!   handle needed to complete it.
//! - `FeedbackRecord` / `FeedbackBatch`: delivery outcomes produced by the hub.
//! - `EventRecord`: one record of the partitioned telemetry stream.
//!
//! All types serialize with serde; payload bytes travel as base64 strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::DecodeError;

#[cfg(test)]
mod tests;

/// Which delivery outcomes the hub should report as feedback for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckLevel {
    #[default]
    None,
    PositiveOnly,
    NegativeOnly,
    Full,
}

impl AckLevel {
    /// Whether a successful delivery produces a feedback record.
    pub fn wants_positive(self) -> bool {
        matches!(self, AckLevel::PositiveOnly | AckLevel::Full)
    }

    /// Whether expiry or rejection produces a feedback record.
    pub fn wants_negative(self) -> bool {
        matches!(self, AckLevel::NegativeOnly | AckLevel::Full)
    }
}

impl FromStr for AckLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(AckLevel::None),
            "positive" | "positive_only" => Ok(AckLevel::PositiveOnly),
            "negative" | "negative_only" => Ok(AckLevel::NegativeOnly),
            "full" => Ok(AckLevel::Full),
            other => Err(format!("unknown ack level '{other}'")),
        }
    }
}

/// A message on its way to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    message_id: String,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    #[serde(default)]
    ack: AckLevel,
}

impl OutboundMessage {
    /// Creates a message with a fresh id and no feedback requested.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            ack: AckLevel::None,
        }
    }

    /// Serializes `value` as JSON and wraps it in a message.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_ack(mut self, ack: AckLevel) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn ack(&self) -> AckLevel {
        self.ack
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The hub's receipt for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Opaque lock token used to complete an inbound message.
///
/// Not `Clone`: the receive loop moves it out of the message and hands it to
/// exactly one completion call.
#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryHandle(String);

impl DeliveryHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cloud-to-device message received by the device.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
    handle: DeliveryHandle,
}

impl InboundMessage {
    pub fn new(
        message_id: impl Into<String>,
        payload: Vec<u8>,
        enqueued_at: DateTime<Utc>,
        delivery_count: u32,
        handle: DeliveryHandle,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
            enqueued_at,
            delivery_count,
            handle,
        }
    }

    /// Decodes the payload as UTF-8 text.
    pub fn text(&self) -> Result<&str, DecodeError> {
        std::str::from_utf8(&self.payload).map_err(|err| DecodeError {
            message_id: self.message_id.clone(),
            reason: err.to_string(),
        })
    }

    pub fn delivery_handle(&self) -> &DeliveryHandle {
        &self.handle
    }

    pub fn into_delivery_handle(self) -> DeliveryHandle {
        self.handle
    }
}

/// Delivery outcome reported by the hub for a message sent with feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Success,
    Expired,
    DeliveryCountExceeded,
    Rejected,
    Purged,
}

impl FeedbackStatus {
    pub fn is_success(self) -> bool {
        self == FeedbackStatus::Success
    }
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedbackStatus::Success => "success",
            FeedbackStatus::Expired => "expired",
            FeedbackStatus::DeliveryCountExceeded => "delivery_count_exceeded",
            FeedbackStatus::Rejected => "rejected",
            FeedbackStatus::Purged => "purged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub original_message_id: String,
    pub device_id: String,
    pub status: FeedbackStatus,
    pub description: String,
    pub enqueued_time: DateTime<Utc>,
}

/// A set of feedback records locked for one consumer.
///
/// An empty batch carries no lock and committing it is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackBatch {
    pub batch_id: Option<String>,
    pub records: Vec<FeedbackRecord>,
}

impl FeedbackBatch {
    pub fn empty() -> Self {
        Self {
            batch_id: None,
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// One record of the partitioned device-to-cloud stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub partition_id: String,
    pub offset: u64,
    pub device_id: String,
    pub message_id: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl EventRecord {
    /// Body as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Credentials for one device, supplied by the identity collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub symmetric_key: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, symmetric_key: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            symmetric_key: symmetric_key.into(),
        }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("symmetric_key", &"<redacted>")
            .finish()
    }
}

/// Serde adapter storing byte payloads as standard base64 strings.
pub mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
