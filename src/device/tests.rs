use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::*;
use crate::hub::{HubConfig, MemoryHub};
use crate::message::{
    AckLevel, DeliveryHandle, DeviceIdentity, FeedbackStatus, InboundMessage, OutboundMessage,
};
use crate::service::FeedbackCollector;
use crate::transport::{DeviceConnector, DeviceTransport, ServiceTransport};
use crate::utils::error::{ConnectError, ReceiveError, SendError, TransportError};

const ENDPOINT: &str = "memory://hub";

fn identity() -> DeviceIdentity {
    DeviceIdentity::new("dev-1", "secret")
}

fn fast_options() -> ReceiverOptions {
    ReceiverOptions {
        poll_timeout: Duration::from_millis(20),
        error_backoff: Duration::from_millis(10),
        ..ReceiverOptions::default()
    }
}

async fn open_session(hub: &MemoryHub) -> Arc<TransportSession> {
    hub.register_device("dev-1", "secret");
    let session = Arc::new(TransportSession::new(Arc::new(hub.clone())));
    session.open(identity(), ENDPOINT).await.unwrap();
    session
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn recorder(into: Arc<Mutex<Vec<String>>>) -> impl MessageListener + 'static {
    listener_fn(move |message: &InboundMessage| {
        into.lock().unwrap().push(message.text()?.to_string());
        Ok(())
    })
}

fn counter(into: Arc<AtomicUsize>) -> impl MessageListener + 'static {
    listener_fn(move |_: &InboundMessage| {
        into.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// Serves a fixed script of receive outcomes and fails every completion.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Option<InboundMessage>, TransportError>>>,
    completions: AtomicUsize,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<Option<InboundMessage>, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            completions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DeviceTransport for ScriptedTransport {
    async fn send_event(&self, message: OutboundMessage) -> Result<String, TransportError> {
        Ok(message.message_id().to_string())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(outcome) => outcome,
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn complete(&self, _handle: &DeliveryHandle) -> Result<(), TransportError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Closed)
    }

    async fn upload_blob(&self, _name: &str, _data: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }
}

struct FixedConnector(Arc<ScriptedTransport>);

#[async_trait]
impl DeviceConnector for FixedConnector {
    async fn connect(
        &self,
        _identity: &DeviceIdentity,
        _endpoint: &str,
    ) -> Result<Arc<dyn DeviceTransport>, TransportError> {
        Ok(self.0.clone())
    }
}

fn scripted_message(id: &str, text: &str) -> InboundMessage {
    InboundMessage::new(
        id,
        text.as_bytes().to_vec(),
        Utc::now(),
        1,
        DeliveryHandle::new(format!("lock-{id}")),
    )
}

#[tokio::test]
async fn test_open_rejects_empty_fields() {
    let session = TransportSession::new(Arc::new(MemoryHub::default()));

    let cases = [
        (DeviceIdentity::new("", "secret"), ENDPOINT, "device id"),
        (DeviceIdentity::new("dev-1", " "), ENDPOINT, "device key"),
        (identity(), "", "endpoint"),
    ];
    for (identity, endpoint, field) in cases {
        match session.open(identity, endpoint).await {
            Err(ConnectError::MissingField(missing)) => assert_eq!(missing, field),
            other => panic!("expected missing {field}, got {other:?}"),
        }
    }
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_open_wraps_transport_failure() {
    let hub = MemoryHub::default();
    let session = TransportSession::new(Arc::new(hub));

    let err = session.open(identity(), ENDPOINT).await.unwrap_err();
    match err {
        ConnectError::Transport { endpoint, source } => {
            assert_eq!(endpoint, ENDPOINT);
            assert!(matches!(source, TransportError::Unauthorized(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_reopen_replaces_session() {
    let hub = MemoryHub::default();
    let session = open_session(&hub).await;
    assert_eq!(session.current().unwrap().endpoint(), ENDPOINT);

    let replaced = session.open(identity(), "memory://other").await.unwrap();
    assert_eq!(replaced.endpoint(), "memory://other");
    assert_eq!(session.current().unwrap().endpoint(), "memory://other");
    assert_eq!(session.current().unwrap().device_id(), "dev-1");

    assert!(session.close().is_some());
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_publish_requires_open_session() {
    let session = Arc::new(TransportSession::new(Arc::new(MemoryHub::default())));
    let publisher = UplinkPublisher::new(session);
    let err = publisher
        .publish(OutboundMessage::new("t=20"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::NotOpen));
}

#[tokio::test]
async fn test_publish_reports_size_limit() {
    let hub = MemoryHub::new(HubConfig {
        max_message_bytes: 4,
        ..HubConfig::default()
    });
    let publisher = UplinkPublisher::new(open_session(&hub).await);

    let err = publisher
        .publish(OutboundMessage::new("too large"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::PayloadTooLarge { size: 9, limit: 4 }));
}

#[tokio::test]
async fn test_publish_with_full_ack_produces_success_feedback() {
    let hub = MemoryHub::default();
    let publisher = UplinkPublisher::new(open_session(&hub).await);

    let ack = publisher
        .publish_json(&json!({"ClientDevice": "dev-1", "LockId": "57"}), AckLevel::Full)
        .await
        .unwrap();

    let partition = hub.partition_for("dev-1");
    let events = hub.events(partition);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_id, ack.message_id);
    let body: serde_json::Value = serde_json::from_slice(&events[0].body).unwrap();
    assert_eq!(body["LockId"], "57");

    let service: Arc<dyn ServiceTransport> = Arc::new(hub.clone());
    let collector = FeedbackCollector::new(service, Duration::from_millis(50));
    let batch = collector.pull_feedback().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.records[0].original_message_id, ack.message_id);
    assert_eq!(batch.records[0].status, FeedbackStatus::Success);
    collector.commit(&batch).await.unwrap();
}

#[tokio::test]
async fn test_upload_blob_sends_whole_stream() {
    let hub = MemoryHub::default();
    let publisher = UplinkPublisher::new(open_session(&hub).await);

    let uploaded = publisher
        .upload_blob("diag/boot.log", &b"kernel ok\nnet ok\n"[..])
        .await
        .unwrap();
    assert_eq!(uploaded, 17);
    assert_eq!(hub.blob("diag/boot.log").unwrap(), b"kernel ok\nnet ok\n");

    let err = publisher.upload_blob("", &b"x"[..]).await.unwrap_err();
    assert!(matches!(err, SendError::Invalid(_)));
}

#[test]
fn test_register_same_id_replaces() {
    let registry = ListenerRegistry::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    assert!(!registry.register("audit", counter(first.clone())));
    let other = registry.subscribe(counter(Arc::new(AtomicUsize::new(0))));
    assert!(registry.register("audit", counter(second.clone())));
    assert_eq!(registry.ids(), vec!["audit".to_string(), other.clone()]);

    let report = registry.dispatch(&scripted_message("m-1", "unlock"));
    assert_eq!(report, DispatchReport { invoked: 2, failed: 0 });
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    assert!(registry.unregister(&other));
    assert!(!registry.unregister(&other));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_dispatch_isolates_failing_listeners() {
    let registry = ListenerRegistry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    registry.register(
        "fails",
        listener_fn(|_: &InboundMessage| Err("listener rejected message".into())),
    );
    registry.register(
        "panics",
        listener_fn(|_: &InboundMessage| panic!("listener bug")),
    );
    registry.register("records", recorder(seen.clone()));

    let report = registry.dispatch(&scripted_message("m-1", "unlock"));
    assert_eq!(report, DispatchReport { invoked: 3, failed: 2 });
    assert_eq!(*seen.lock().unwrap(), vec!["unlock".to_string()]);
}

#[tokio::test]
async fn test_receiver_start_and_stop() {
    let hub = MemoryHub::default();
    let unopened = Arc::new(TransportSession::new(Arc::new(hub.clone())));
    let receiver = DownlinkReceiver::new(unopened, fast_options());
    assert!(matches!(receiver.start(), Err(ReceiveError::NotOpen)));
    assert_eq!(receiver.state(), ReceiverState::Idle);

    let receiver = DownlinkReceiver::new(open_session(&hub).await, fast_options());
    receiver.start().unwrap();
    assert!(receiver.is_running());
    assert_ne!(receiver.state(), ReceiverState::Idle);
    assert!(matches!(receiver.start(), Err(ReceiveError::AlreadyRunning)));

    receiver.stop().await;
    assert!(!receiver.is_running());
    assert_eq!(receiver.state(), ReceiverState::Idle);

    // a stopped receiver can be started again
    receiver.start().unwrap();
    receiver.stop().await;
}

#[tokio::test]
async fn test_unlock_reaches_every_listener_and_is_completed_once() {
    let hub = MemoryHub::default();
    let receiver = DownlinkReceiver::new(open_session(&hub).await, fast_options());
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    receiver.register("door", recorder(first.clone()));
    receiver.subscribe(recorder(second.clone()));
    receiver.start().unwrap();

    let sent = hub
        .send_command("dev-1", OutboundMessage::new("unlock"))
        .await
        .unwrap();
    eventually("completion", || !hub.completed_message_ids().is_empty()).await;
    receiver.stop().await;

    assert_eq!(*first.lock().unwrap(), vec!["unlock".to_string()]);
    assert_eq!(*second.lock().unwrap(), vec!["unlock".to_string()]);
    assert_eq!(hub.completed_message_ids(), vec![sent]);
    assert_eq!(hub.pending_commands("dev-1"), 0);
}

#[tokio::test]
async fn test_every_message_completed_despite_listener_faults() {
    let hub = MemoryHub::default();
    let receiver = DownlinkReceiver::new(open_session(&hub).await, fast_options());
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.register(
        "fails",
        listener_fn(|_: &InboundMessage| Err("boom".into())),
    );
    receiver.register(
        "panics",
        listener_fn(|_: &InboundMessage| panic!("listener bug")),
    );
    receiver.register("records", recorder(seen.clone()));

    for n in 0..5 {
        hub.send_command("dev-1", OutboundMessage::new(format!("cmd-{n}")))
            .await
            .unwrap();
    }
    receiver.start().unwrap();
    eventually("five completions", || hub.completed_message_ids().len() == 5).await;
    receiver.stop().await;

    assert_eq!(
        *seen.lock().unwrap(),
        (0..5).map(|n| format!("cmd-{n}")).collect::<Vec<_>>()
    );
    let stats = receiver.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.dispatched, 5);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.listener_failures, 10);
    assert_eq!(stats.ack_failures, 0);
}

#[tokio::test]
async fn test_undecodable_message_is_completed_by_default() {
    let hub = MemoryHub::default();
    let receiver = DownlinkReceiver::new(open_session(&hub).await, fast_options());
    let calls = Arc::new(AtomicUsize::new(0));
    receiver.register("count", counter(calls.clone()));

    hub.send_command("dev-1", OutboundMessage::new(vec![0xff, 0xfe, 0xfd]))
        .await
        .unwrap();
    receiver.start().unwrap();
    eventually("completion", || hub.completed_message_ids().len() == 1).await;
    receiver.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(receiver.stats().decode_failures, 1);
    assert_eq!(receiver.stats().completed, 1);
}

#[tokio::test]
async fn test_undecodable_message_left_locked_when_abandoning() {
    let hub = MemoryHub::default();
    let options = ReceiverOptions {
        on_decode_failure: DecodeFailurePolicy::Abandon,
        ..fast_options()
    };
    let receiver = DownlinkReceiver::new(open_session(&hub).await, options);

    hub.send_command("dev-1", OutboundMessage::new(vec![0xc3, 0x28]))
        .await
        .unwrap();
    receiver.start().unwrap();
    eventually("decode failure", || receiver.stats().decode_failures == 1).await;
    receiver.stop().await;

    assert!(hub.completed_message_ids().is_empty());
    assert_eq!(receiver.stats().completed, 0);
    // still leased until the lock expires
    assert_eq!(hub.pending_commands("dev-1"), 1);
}

#[tokio::test]
async fn test_loop_survives_ack_and_receive_failures() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(TransportError::Io("connection reset".to_string())),
        Ok(Some(scripted_message("m-1", "unlock"))),
        Ok(None),
        Ok(Some(scripted_message("m-2", "lock"))),
    ]));
    let session = Arc::new(TransportSession::new(Arc::new(FixedConnector(
        transport.clone(),
    ))));
    session.open(identity(), ENDPOINT).await.unwrap();

    let receiver = DownlinkReceiver::new(session, fast_options());
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.register("records", recorder(seen.clone()));
    receiver.start().unwrap();

    eventually("two completion attempts", || {
        transport.completions.load(Ordering::SeqCst) == 2
    })
    .await;
    receiver.stop().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["unlock".to_string(), "lock".to_string()]
    );
    let stats = receiver.stats();
    assert_eq!(stats.receive_errors, 1);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.ack_failures, 2);
    assert_eq!(stats.completed, 0);
}
