use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::hub::memory::{MemoryDeviceTransport, MemoryHub};
use crate::message::{DeliveryHandle, DeviceIdentity};
use crate::transport::message::{ClientFrame, Reply, ServerFrame};
use crate::transport::{DeviceTransport, ServiceTransport};
use crate::utils::error::TransportError;

/// What a connection has authenticated as.
#[derive(Clone)]
enum Role {
    Anonymous,
    Device(Arc<MemoryDeviceTransport>),
    Service,
}

/// Binds `addr` and serves the hub protocol until the listener fails.
pub async fn start_emulator(addr: &str, hub: MemoryHub) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("hub emulator listening on ws://{}", listener.local_addr()?);
    serve(listener, hub).await;
    Ok(())
}

/// Accepts WebSocket connections on `listener` and answers their frames from
/// `hub`. Each request runs on its own task so a long-poll does not hold up
/// other requests on the same connection. Requests still pending when the
/// connection closes are aborted.
pub async fn serve(listener: TcpListener, hub: MemoryHub) {
    while let Ok((stream, peer)) = listener.accept().await {
        let hub = hub.clone();
        let connection_id = format!("conn-{}", Uuid::new_v4());

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket handshake error");
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

            // replies -> socket
            let forward_id = connection_id.clone();
            spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!(connection = %forward_id, error = %e, "failed to send reply");
                        break;
                    }
                }
                debug!(connection = %forward_id, "send loop closed");
            });

            let mut role = Role::Anonymous;
            let mut requests = JoinSet::new();
            while let Some(Ok(msg)) = ws_receiver.next().await {
                while requests.try_join_next().is_some() {}
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                let frame = match serde_json::from_str::<ClientFrame>(text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(connection = %connection_id, error = %err, "invalid client frame");
                        continue;
                    }
                };

                match frame {
                    ClientFrame::ConnectDevice {
                        request_id,
                        device_id,
                        key,
                    } => {
                        let identity = DeviceIdentity::new(device_id, key);
                        let outcome = hub.device_transport(&identity).map(|device| {
                            info!(connection = %connection_id, device_id = %identity.device_id, "device connected");
                            role = Role::Device(Arc::new(device));
                            Reply::Connected
                        });
                        reply(&tx, request_id, outcome);
                    }
                    ClientFrame::ConnectService { request_id } => {
                        info!(connection = %connection_id, "service connected");
                        role = Role::Service;
                        reply(&tx, request_id, Ok(Reply::Connected));
                    }
                    frame => {
                        let role = role.clone();
                        let hub = hub.clone();
                        let tx = tx.clone();
                        requests.spawn(async move {
                            let request_id = frame.request_id();
                            let outcome = handle(&hub, &role, frame).await;
                            reply(&tx, request_id, outcome);
                        });
                    }
                }
            }

            // a pending receive would otherwise lease a command to nobody
            requests.abort_all();
            info!(connection = %connection_id, "disconnected");
        });
    }
}

async fn handle(hub: &MemoryHub, role: &Role, frame: ClientFrame) -> Result<Reply, TransportError> {
    match (role, frame) {
        (Role::Anonymous, _) => Err(TransportError::Unauthorized(
            "must connect first".to_string(),
        )),
        (Role::Device(device), ClientFrame::SendEvent { message, .. }) => device
            .send_event(message)
            .await
            .map(|message_id| Reply::Accepted { message_id }),
        (Role::Device(device), ClientFrame::Receive { wait_ms, .. }) => device
            .receive(Duration::from_millis(wait_ms))
            .await
            .map(|message| Reply::Delivery { message }),
        (Role::Device(device), ClientFrame::Complete { token, .. }) => device
            .complete(&DeliveryHandle::new(token))
            .await
            .map(|()| Reply::Completed),
        (Role::Device(device), ClientFrame::UploadBlob { name, data, .. }) => device
            .upload_blob(&name, data)
            .await
            .map(|()| Reply::Completed),
        (Role::Service, ClientFrame::SendCommand {
            device_id, message, ..
        }) => hub
            .send_command(&device_id, message)
            .await
            .map(|message_id| Reply::Accepted { message_id }),
        (Role::Service, ClientFrame::ReceiveFeedback { wait_ms, .. }) => hub
            .receive_feedback(Duration::from_millis(wait_ms))
            .await
            .map(|batch| Reply::Feedback { batch }),
        (Role::Service, ClientFrame::CompleteFeedback { batch_id, .. }) => hub
            .complete_feedback(&batch_id)
            .await
            .map(|()| Reply::Completed),
        (Role::Service, ClientFrame::ListPartitions { .. }) => hub
            .partition_ids()
            .await
            .map(|ids| Reply::Partitions { ids }),
        (Role::Service, ClientFrame::ReadPartition {
            partition_id,
            since,
            wait_ms,
            ..
        }) => hub
            .read_partition(&partition_id, since, Duration::from_millis(wait_ms))
            .await
            .map(|record| Reply::Event { record }),
        (_, frame) => Err(TransportError::Rejected(format!(
            "request {} is not allowed on this connection",
            frame.request_id()
        ))),
    }
}

fn reply(
    tx: &mpsc::UnboundedSender<WsMessage>,
    request_id: u64,
    outcome: Result<Reply, TransportError>,
) {
    let frame = match outcome {
        Ok(reply) => ServerFrame::Reply { request_id, reply },
        Err(error) => ServerFrame::Failure { request_id, error },
    };
    match serde_json::to_string(&frame) {
        Ok(json) => {
            if tx.send(WsMessage::text(json)).is_err() {
                debug!(request_id, "connection gone before reply");
            }
        }
        Err(e) => warn!(request_id, error = %e, "failed to serialize reply"),
    }
}
