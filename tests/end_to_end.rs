use std::sync::Arc;
use std::time::Duration;

use hublink::device::{TransportSession, UplinkPublisher};
use hublink::hub::{MemoryHub, serve};
use hublink::message::{AckLevel, DeviceIdentity, FeedbackStatus};
use hublink::service::{FeedbackCollector, PartitionedReader};
use hublink::transport::{ServiceTransport, WsConnector, WsServiceTransport};
use serde_json::json;
use tokio::net::TcpListener;

#[tokio::test]
async fn lock_request_is_published_and_acknowledged() {
    let hub = MemoryHub::default();
    hub.register_device("dev-1", "secret");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, hub.clone()));

    let session = Arc::new(TransportSession::new(Arc::new(WsConnector)));
    session
        .open(DeviceIdentity::new("dev-1", "secret"), &endpoint)
        .await
        .expect("device connect");
    let publisher = UplinkPublisher::new(session);
    let ack = publisher
        .publish_json(&json!({"ClientDevice": "dev-1", "LockId": "57"}), AckLevel::Full)
        .await
        .expect("publish");

    let service: Arc<dyn ServiceTransport> =
        Arc::new(WsServiceTransport::connect(&endpoint).await.expect("service connect"));

    let collector = FeedbackCollector::new(service.clone(), Duration::from_secs(1));
    let batch = collector.pull_feedback().await.unwrap();
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.records[0].original_message_id, ack.message_id);
    assert_eq!(batch.records[0].status, FeedbackStatus::Success);
    collector.commit(&batch).await.unwrap();
    assert!(collector.pull_feedback().await.unwrap().is_empty());

    let reader = PartitionedReader::new(service, Duration::from_secs(60), Duration::from_millis(100));
    let results = reader.read_next_per_partition().await.unwrap();
    assert_eq!(results.len(), 4);
    let records: Vec<_> = results.into_iter().filter_map(|(_, record)| record).collect();
    assert_eq!(records.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&records[0].body).unwrap();
    assert_eq!(body, json!({"ClientDevice": "dev-1", "LockId": "57"}));
}
