//! The JSON envelope shared by both directions of the protocol:
//! `{"state": {"reported": {...}}}` from the device, `{"state": {"desired":
//! {...}}}` toward it. The inner object is an unstructured mapping the core
//! never interprets — keys and scalar types pass through verbatim.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Metadata fields every write carries, in addition to the caller's keys.
pub const COMMAND_TYPE: &str = "app";

/// Parses a device status payload and returns the `state.reported` object
/// verbatim. Fails with [`Error::Protocol`] if `state` or `reported` is
/// missing or not an object.
pub fn parse_status(plaintext: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(plaintext)
        .map_err(|e| Error::Protocol(format!("status payload is not valid JSON: {e}")))?;

    value
        .get("state")
        .and_then(|state| state.get("reported"))
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| Error::Protocol("status payload missing state.reported object".to_string()))
}

/// Builds the plaintext JSON for a control write: the fixed metadata
/// fields plus the caller's keys, with user keys winning on conflict.
pub fn build_control_envelope(data: &Map<String, Value>) -> String {
    let mut desired = Map::new();
    desired.insert("CommandType".to_string(), Value::String(COMMAND_TYPE.to_string()));
    desired.insert("DeviceId".to_string(), Value::String(String::new()));
    desired.insert("EnduserId".to_string(), Value::String(String::new()));
    for (key, value) in data {
        desired.insert(key.clone(), value.clone());
    }

    let mut state = Map::new();
    state.insert("desired".to_string(), Value::Object(desired));
    let mut envelope = Map::new();
    envelope.insert("state".to_string(), Value::Object(state));

    Value::Object(envelope).to_string()
}

/// Parses a (plaintext) write response and reports whether `status ==
/// "success"`.
pub fn write_succeeded(plaintext: &str) -> bool {
    serde_json::from_str::<Value>(plaintext)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_str).map(|s| s == "success"))
        .unwrap_or(false)
}
