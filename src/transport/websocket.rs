//! WebSocket client side of the hub protocol.
//!
//! A `WsConnection` multiplexes request/response pairs over one socket: a
//! writer task drains an unbounded channel into the sink, and a reader task
//! routes each `ServerFrame` to the caller waiting on its `request_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::message::{
    DeliveryHandle, DeviceIdentity, EventRecord, FeedbackBatch, InboundMessage, OutboundMessage,
};
use crate::transport::message::{ClientFrame, Reply, ServerFrame};
use crate::transport::traits::{DeviceConnector, DeviceTransport, ServiceTransport};
use crate::utils::error::TransportError;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>>;

struct WsConnection {
    endpoint: String,
    outgoing: mpsc::UnboundedSender<WsMessage>,
    pending: PendingReplies,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl WsConnection {
    async fn open(endpoint: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let send_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(endpoint = %send_endpoint, error = %e, "failed to write frame");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let read_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(endpoint = %read_endpoint, error = %e, "connection failed");
                        break;
                    }
                };
                if msg.is_close() {
                    break;
                }
                if !msg.is_text() {
                    continue;
                }
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                match serde_json::from_str::<ServerFrame>(text) {
                    Ok(frame) => {
                        let waiter = reader_pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&frame.request_id());
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(frame);
                            }
                            None => debug!(
                                request_id = frame.request_id(),
                                "reply for unknown request"
                            ),
                        }
                    }
                    Err(e) => warn!(error = %e, "invalid server frame"),
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // dropping the senders wakes every waiter with `Closed`
            reader_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            debug!(endpoint = %read_endpoint, "connection closed");
        });

        Ok(Self {
            endpoint: endpoint.to_string(),
            outgoing: tx,
            pending,
            closed,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<Reply, TransportError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = build(request_id);
        let text =
            serde_json::to_string(&frame).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        if self.closed.load(Ordering::SeqCst) || self.outgoing.send(WsMessage::text(text)).is_err()
        {
            self.forget(request_id);
            return Err(TransportError::Closed);
        }

        let frame = rx.await.map_err(|_| TransportError::Closed)?;
        frame.into_result()
    }

    fn forget(&self, request_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn unexpected(reply: Reply) -> TransportError {
    TransportError::Protocol(format!("unexpected reply '{}'", reply.kind()))
}

fn wait_ms(wait: Duration) -> u64 {
    u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
}

/// Device channel over a WebSocket connection.
#[derive(Debug)]
pub struct WsDeviceTransport {
    conn: WsConnection,
}

#[async_trait]
impl DeviceTransport for WsDeviceTransport {
    async fn send_event(&self, message: OutboundMessage) -> Result<String, TransportError> {
        match self
            .conn
            .request(|request_id| ClientFrame::SendEvent {
                request_id,
                message,
            })
            .await?
        {
            Reply::Accepted { message_id } => Ok(message_id),
            other => Err(unexpected(other)),
        }
    }

    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, TransportError> {
        match self
            .conn
            .request(|request_id| ClientFrame::Receive {
                request_id,
                wait_ms: wait_ms(wait),
            })
            .await?
        {
            Reply::Delivery { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    async fn complete(&self, handle: &DeliveryHandle) -> Result<(), TransportError> {
        let token = handle.token().to_string();
        match self
            .conn
            .request(|request_id| ClientFrame::Complete { request_id, token })
            .await?
        {
            Reply::Completed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let name = name.to_string();
        match self
            .conn
            .request(|request_id| ClientFrame::UploadBlob {
                request_id,
                name,
                data,
            })
            .await?
        {
            Reply::Completed => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Opens `WsDeviceTransport`s; the endpoint is a `ws://` or `wss://` URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl DeviceConnector for WsConnector {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        endpoint: &str,
    ) -> Result<Arc<dyn DeviceTransport>, TransportError> {
        let conn = WsConnection::open(endpoint).await?;
        let device_id = identity.device_id.clone();
        let key = identity.symmetric_key.clone();
        match conn
            .request(|request_id| ClientFrame::ConnectDevice {
                request_id,
                device_id,
                key,
            })
            .await?
        {
            Reply::Connected => Ok(Arc::new(WsDeviceTransport { conn })),
            other => Err(unexpected(other)),
        }
    }
}

/// Service channel over a WebSocket connection.
#[derive(Debug)]
pub struct WsServiceTransport {
    conn: WsConnection,
}

impl WsServiceTransport {
    pub async fn connect(endpoint: &str) -> Result<Self, TransportError> {
        let conn = WsConnection::open(endpoint).await?;
        match conn
            .request(|request_id| ClientFrame::ConnectService { request_id })
            .await?
        {
            Reply::Connected => Ok(Self { conn }),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl ServiceTransport for WsServiceTransport {
    async fn send_command(
        &self,
        device_id: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        let device_id = device_id.to_string();
        match self
            .conn
            .request(|request_id| ClientFrame::SendCommand {
                request_id,
                device_id,
                message,
            })
            .await?
        {
            Reply::Accepted { message_id } => Ok(message_id),
            other => Err(unexpected(other)),
        }
    }

    async fn receive_feedback(&self, wait: Duration) -> Result<FeedbackBatch, TransportError> {
        match self
            .conn
            .request(|request_id| ClientFrame::ReceiveFeedback {
                request_id,
                wait_ms: wait_ms(wait),
            })
            .await?
        {
            Reply::Feedback { batch } => Ok(batch),
            other => Err(unexpected(other)),
        }
    }

    async fn complete_feedback(&self, batch_id: &str) -> Result<(), TransportError> {
        let batch_id = batch_id.to_string();
        match self
            .conn
            .request(|request_id| ClientFrame::CompleteFeedback {
                request_id,
                batch_id,
            })
            .await?
        {
            Reply::Completed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn partition_ids(&self) -> Result<Vec<String>, TransportError> {
        match self
            .conn
            .request(|request_id| ClientFrame::ListPartitions { request_id })
            .await?
        {
            Reply::Partitions { ids } => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    async fn read_partition(
        &self,
        partition_id: &str,
        since: DateTime<Utc>,
        wait: Duration,
    ) -> Result<Option<EventRecord>, TransportError> {
        let partition_id = partition_id.to_string();
        match self
            .conn
            .request(|request_id| ClientFrame::ReadPartition {
                request_id,
                partition_id,
                since,
                wait_ms: wait_ms(wait),
            })
            .await?
        {
            Reply::Event { record } => Ok(record),
            other => Err(unexpected(other)),
        }
    }
}
