use super::*;
use serde_json::json;

#[test]
fn test_ack_level_flags() {
    assert!(!AckLevel::None.wants_positive());
    assert!(!AckLevel::None.wants_negative());
    assert!(AckLevel::PositiveOnly.wants_positive());
    assert!(!AckLevel::PositiveOnly.wants_negative());
    assert!(AckLevel::NegativeOnly.wants_negative());
    assert!(AckLevel::Full.wants_positive());
    assert!(AckLevel::Full.wants_negative());
}

#[test]
fn test_ack_level_parse() {
    assert_eq!("full".parse::<AckLevel>(), Ok(AckLevel::Full));
    assert_eq!("Positive-Only".parse::<AckLevel>(), Ok(AckLevel::PositiveOnly));
    assert_eq!("negative".parse::<AckLevel>(), Ok(AckLevel::NegativeOnly));
    assert!("sometimes".parse::<AckLevel>().is_err());
}

#[test]
fn test_outbound_message_defaults() {
    let first = OutboundMessage::new("hello");
    let second = OutboundMessage::new("hello");
    assert_eq!(first.ack(), AckLevel::None);
    assert_eq!(first.payload(), b"hello");
    assert_eq!(first.len(), 5);
    assert_ne!(first.message_id(), second.message_id());
}

#[test]
fn test_outbound_message_json_payload() {
    let msg = OutboundMessage::json(&json!({ "ClientDevice": "dev-1", "LockId": "57" }))
        .unwrap()
        .with_ack(AckLevel::Full);
    let body: serde_json::Value = serde_json::from_slice(msg.payload()).unwrap();
    assert_eq!(body["LockId"], "57");
    assert_eq!(msg.ack(), AckLevel::Full);
}

#[test]
fn test_outbound_message_wire_uses_base64() {
    let msg = OutboundMessage::new(vec![0u8, 159, 146, 150]).with_message_id("m-1");
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["payload"], "AJ+Slg==");
    assert_eq!(value["ack"], "none");

    let parsed: OutboundMessage = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_inbound_message_text_decoding() {
    let ok = InboundMessage::new(
        "m-1",
        b"unlock".to_vec(),
        Utc::now(),
        1,
        DeliveryHandle::new("t-1"),
    );
    assert_eq!(ok.text().unwrap(), "unlock");

    let bad = InboundMessage::new(
        "m-2",
        vec![0xff, 0xfe],
        Utc::now(),
        1,
        DeliveryHandle::new("t-2"),
    );
    let err = bad.text().unwrap_err();
    assert_eq!(err.message_id, "m-2");
    assert_eq!(bad.into_delivery_handle().token(), "t-2");
}

#[test]
fn test_event_record_text_is_lossy() {
    let record = EventRecord {
        partition_id: "0".to_string(),
        offset: 0,
        device_id: "dev-1".to_string(),
        message_id: "m-1".to_string(),
        enqueued_at: Utc::now(),
        body: vec![b'o', b'k', 0xff],
    };
    assert!(record.text().starts_with("ok"));
}

#[test]
fn test_identity_debug_redacts_key() {
    let identity = DeviceIdentity::new("dev-1", "c2VjcmV0");
    let printed = format!("{identity:?}");
    assert!(printed.contains("dev-1"));
    assert!(!printed.contains("c2VjcmV0"));
}

#[test]
fn test_empty_feedback_batch() {
    let batch = FeedbackBatch::empty();
    assert!(batch.is_empty());
    assert!(batch.batch_id.is_none());
}
