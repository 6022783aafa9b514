#![allow(clippy::unwrap_used, clippy::expect_used)]

use prospector_core::*;

// ---------------------------------------------------------------------------
// 1. Message serialization roundtrip keeps metadata and ids
// ---------------------------------------------------------------------------

#[test]
fn message_serialization_roundtrip() {
    let msg = Message::system("Find plumbers in Austin")
        .with_metadata("source", serde_json::Value::String("test".to_string()));

    let json = serde_json::to_string(&msg).unwrap();
    let deserialized: Message = serde_json::from_str(&json).unwrap();

    assert_eq!(deserialized.id, msg.id);
    assert_eq!(deserialized.role, Role::System);
    assert_eq!(deserialized.content, "Find plumbers in Austin");
    assert_eq!(deserialized.timestamp, msg.timestamp);
    assert_eq!(
        deserialized.metadata.get("source"),
        Some(&serde_json::Value::String("test".to_string()))
    );
}

// ---------------------------------------------------------------------------
// 2. Missing metadata defaults to an empty map
// ---------------------------------------------------------------------------

#[test]
fn message_without_metadata_deserializes() {
    let json = r#"{
        "id": "6f1c2f7e-6b1a-4d8e-9a55-0d3c1a2b4c5d",
        "role": "user",
        "content": "hi",
        "timestamp": "2025-01-01T00:00:00Z"
    }"#;
    let msg: Message = serde_json::from_str(json).unwrap();
    assert_eq!(msg.role, Role::User);
    assert!(msg.metadata.is_empty());
}

// ---------------------------------------------------------------------------
// 3. Error conversions
// ---------------------------------------------------------------------------

#[test]
fn json_error_converts() {
    let err: ProspectorError = serde_json::from_str::<Message>("not json").unwrap_err().into();
    assert!(matches!(err, ProspectorError::Json(_)));
    assert!(err.to_string().starts_with("JSON error:"));
}

#[test]
fn io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: ProspectorError = io.into();
    assert!(matches!(err, ProspectorError::Io(_)));
}
