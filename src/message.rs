// src/message.rs

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{ConnectorError, Result};

/// Reserved payload key carrying the correlation identifier.
///
/// Publishing stamps this key on every outgoing message; consumers correlate
/// replies by reading it back. Payloads must not use it for anything else.
pub const MESSAGE_ID_KEY: &str = "message_id";

/// Generates a correlation identifier: a v4 UUID in compact hex form.
pub fn create_unique_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Checks that a payload is a non-empty JSON object, the only shape the
/// connector will put on the wire.
pub fn ensure_valid_payload(payload: &Value) -> Result<&Map<String, Value>> {
    match payload.as_object() {
        Some(map) if !map.is_empty() => Ok(map),
        _ => Err(ConnectorError::Validation(format!(
            "expected a non-empty JSON object, got: {payload}"
        ))),
    }
}

/// Validates the payload and stamps a fresh [`MESSAGE_ID_KEY`] on it.
///
/// Always generates a new id, replacing any value already present under the
/// reserved key. Returns the id that went on the message.
pub fn stamp_message_id(payload: &mut Value) -> Result<String> {
    ensure_valid_payload(payload)?;

    let message_id = create_unique_id();
    if let Some(map) = payload.as_object_mut() {
        map.insert(MESSAGE_ID_KEY.to_string(), Value::String(message_id.clone()));
    }
    Ok(message_id)
}

/// Serializes a payload to the JSON wire form.
pub fn encode_payload(payload: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Deserializes a message body received from the broker.
pub fn decode_payload(body: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(body)?)
}
