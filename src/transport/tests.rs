use chrono::Utc;
use serde_json::json;

use crate::message::{AckLevel, DeliveryHandle, InboundMessage, OutboundMessage};
use crate::transport::message::{ClientFrame, Reply, ServerFrame};
use crate::utils::error::TransportError;

#[test]
fn test_parse_receive_frame() {
    let msg = json!({
        "type": "receive",
        "request_id": 7,
        "wait_ms": 5000
    })
    .to_string();

    match serde_json::from_str::<ClientFrame>(&msg).unwrap() {
        ClientFrame::Receive {
            request_id,
            wait_ms,
        } => {
            assert_eq!(request_id, 7);
            assert_eq!(wait_ms, 5000);
        }
        other => panic!("Expected Receive, got {:?}", other),
    }
}

#[test]
fn test_send_event_frame_encodes_payload() {
    let frame = ClientFrame::SendEvent {
        request_id: 3,
        message: OutboundMessage::new("t=21")
            .with_message_id("m-1")
            .with_ack(AckLevel::Full),
    };
    let value = serde_json::to_value(&frame).unwrap();

    assert_eq!(value["type"], "send_event");
    assert_eq!(value["request_id"], 3);
    assert_eq!(value["message"]["message_id"], "m-1");
    assert_eq!(value["message"]["payload"], "dD0yMQ==");
    assert_eq!(value["message"]["ack"], "full");
    assert_eq!(frame.request_id(), 3);
}

#[test]
fn test_unknown_frame_type_is_rejected() {
    let msg = json!({ "type": "subscribe", "request_id": 1, "topic": "chat" }).to_string();
    assert!(serde_json::from_str::<ClientFrame>(&msg).is_err());
}

#[test]
fn test_parse_empty_delivery_reply() {
    let msg = json!({
        "type": "reply",
        "request_id": 4,
        "reply": { "kind": "delivery", "message": null }
    })
    .to_string();

    let frame: ServerFrame = serde_json::from_str(&msg).unwrap();
    assert_eq!(frame.request_id(), 4);
    match frame.into_result().unwrap() {
        Reply::Delivery { message } => assert!(message.is_none()),
        other => panic!("Expected Delivery, got {}", other.kind()),
    }
}

#[test]
fn test_delivery_reply_carries_handle() {
    let frame = ServerFrame::Reply {
        request_id: 9,
        reply: Reply::Delivery {
            message: Some(InboundMessage::new(
                "m-2",
                b"unlock".to_vec(),
                Utc::now(),
                1,
                DeliveryHandle::new("lock-1"),
            )),
        },
    };
    let text = serde_json::to_string(&frame).unwrap();
    let parsed: ServerFrame = serde_json::from_str(&text).unwrap();

    match parsed.into_result().unwrap() {
        Reply::Delivery {
            message: Some(message),
        } => {
            assert_eq!(message.text().unwrap(), "unlock");
            assert_eq!(message.delivery_handle().token(), "lock-1");
        }
        other => panic!("Expected Delivery, got {}", other.kind()),
    }
}

#[test]
fn test_failure_frame_carries_error() {
    let msg = json!({
        "type": "failure",
        "request_id": 2,
        "error": { "kind": "payload_too_large", "detail": { "size": 300000, "limit": 262144 } }
    })
    .to_string();

    let frame: ServerFrame = serde_json::from_str(&msg).unwrap();
    assert_eq!(
        frame.into_result().unwrap_err(),
        TransportError::PayloadTooLarge {
            size: 300000,
            limit: 262144
        }
    );

    let closed = serde_json::to_value(ServerFrame::Failure {
        request_id: 5,
        error: TransportError::Closed,
    })
    .unwrap();
    assert_eq!(closed["error"]["kind"], "closed");
}
