//! Frames exchanged between the WebSocket transport and the hub emulator.
//!
//! Every client frame carries a `request_id`; the hub answers each one with
//! exactly one `ServerFrame` echoing it, so several requests (for example a
//! long-poll receive and a publish) can share one connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{EventRecord, FeedbackBatch, InboundMessage, OutboundMessage, base64_bytes};
use crate::utils::error::TransportError;

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "connect_device")]
    ConnectDevice {
        request_id: u64,
        device_id: String,
        key: String,
    },
    #[serde(rename = "connect_service")]
    ConnectService { request_id: u64 },
    #[serde(rename = "send_event")]
    SendEvent {
        request_id: u64,
        message: OutboundMessage,
    },
    #[serde(rename = "receive")]
    Receive { request_id: u64, wait_ms: u64 },
    #[serde(rename = "complete")]
    Complete { request_id: u64, token: String },
    #[serde(rename = "upload_blob")]
    UploadBlob {
        request_id: u64,
        name: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "send_command")]
    SendCommand {
        request_id: u64,
        device_id: String,
        message: OutboundMessage,
    },
    #[serde(rename = "receive_feedback")]
    ReceiveFeedback { request_id: u64, wait_ms: u64 },
    #[serde(rename = "complete_feedback")]
    CompleteFeedback { request_id: u64, batch_id: String },
    #[serde(rename = "list_partitions")]
    ListPartitions { request_id: u64 },
    #[serde(rename = "read_partition")]
    ReadPartition {
        request_id: u64,
        partition_id: String,
        since: DateTime<Utc>,
        wait_ms: u64,
    },
}

impl ClientFrame {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientFrame::ConnectDevice { request_id, .. }
            | ClientFrame::ConnectService { request_id }
            | ClientFrame::SendEvent { request_id, .. }
            | ClientFrame::Receive { request_id, .. }
            | ClientFrame::Complete { request_id, .. }
            | ClientFrame::UploadBlob { request_id, .. }
            | ClientFrame::SendCommand { request_id, .. }
            | ClientFrame::ReceiveFeedback { request_id, .. }
            | ClientFrame::CompleteFeedback { request_id, .. }
            | ClientFrame::ListPartitions { request_id }
            | ClientFrame::ReadPartition { request_id, .. } => *request_id,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "reply")]
    Reply { request_id: u64, reply: Reply },
    #[serde(rename = "failure")]
    Failure {
        request_id: u64,
        error: TransportError,
    },
}

impl ServerFrame {
    pub fn request_id(&self) -> u64 {
        match self {
            ServerFrame::Reply { request_id, .. } | ServerFrame::Failure { request_id, .. } => {
                *request_id
            }
        }
    }

    pub fn into_result(self) -> Result<Reply, TransportError> {
        match self {
            ServerFrame::Reply { reply, .. } => Ok(reply),
            ServerFrame::Failure { error, .. } => Err(error),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Connected,
    Accepted { message_id: String },
    Delivery { message: Option<InboundMessage> },
    Completed,
    Feedback { batch: FeedbackBatch },
    Partitions { ids: Vec<String> },
    Event { record: Option<EventRecord> },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Connected => "connected",
            Reply::Accepted { .. } => "accepted",
            Reply::Delivery { .. } => "delivery",
            Reply::Completed => "completed",
            Reply::Feedback { .. } => "feedback",
            Reply::Partitions { .. } => "partitions",
            Reply::Event { .. } => "event",
        }
    }
}
