//! The `error` module defines the error taxonomy used throughout `hublink`.
//!
//! `TransportError` is what a hub implementation reports. The remaining types
//! are what callers of the session, publisher, receiver, collector and reader
//! see: connection and publish failures are returned synchronously, while
//! `AckError` and `DecodeError` are produced inside the receive loop and only
//! ever logged there.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a hub transport (in-memory or over the wire).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("payload of {size} bytes exceeds hub limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(String),
}

/// Session establishment failed. Never retried automatically.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),

    #[error("failed to connect to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: TransportError,
    },
}

/// A publish (or command send, or blob upload) was not accepted by the hub.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("session is not open")]
    NotOpen,

    #[error("payload of {size} bytes exceeds hub limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("send failed: {0}")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PayloadTooLarge { size, limit } => {
                SendError::PayloadTooLarge { size, limit }
            }
            other => SendError::Transport(other),
        }
    }
}

/// A receive-side operation failed. "No data available" is never an error.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("session is not open")]
    NotOpen,

    #[error("receive loop is already running")]
    AlreadyRunning,

    #[error("invalid lookback window: {0}")]
    InvalidWindow(String),

    #[error("receive failed: {0}")]
    Transport(#[from] TransportError),
}

/// Completing a message or committing a feedback batch failed. The hub keeps
/// the target and redelivers it later.
#[derive(Debug, Error)]
#[error("acknowledgement of {target} failed: {source}")]
pub struct AckError {
    pub target: String,
    #[source]
    pub source: TransportError,
}

/// An inbound payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message {message_id} has a malformed payload: {reason}")]
pub struct DecodeError {
    pub message_id: String,
    pub reason: String,
}
