use serde::Deserialize;
use serde_json::{json, Value};

use super::PushError;

pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const TYPE_INVOCATION: u8 = 1;
pub const TYPE_COMPLETION: u8 = 3;
pub const TYPE_PING: u8 = 6;
pub const TYPE_CLOSE: u8 = 7;

pub const TARGET_PRODUCT_UPDATE: &str = "ProductUpdate";
pub const TARGET_SUBSCRIBE: &str = "SubscribeWithCurrentState";

fn frame(value: Value) -> String {
    let mut text = value.to_string();
    text.push(RECORD_SEPARATOR);
    text
}

pub fn handshake_frame() -> String {
    frame(json!({"protocol": "json", "version": 1}))
}

pub fn ping_frame() -> String {
    frame(json!({"type": TYPE_PING}))
}

pub fn close_frame() -> String {
    frame(json!({"type": TYPE_CLOSE}))
}

pub fn subscribe_frame(invocation_id: u64, charger_id: &str) -> String {
    frame(json!({
        "type": TYPE_INVOCATION,
        "invocationId": invocation_id.to_string(),
        "target": TARGET_SUBSCRIBE,
        "arguments": [charger_id, true],
    }))
}

/// Complete records in a text frame. A trailing partial record is ignored.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    let complete = match text.rfind(RECORD_SEPARATOR) {
        Some(end) => &text[..end],
        None => "",
    };
    complete
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

/// Server answer to the handshake. An `error` means the hub refused us.
pub fn check_handshake(record: &str) -> Result<(), PushError> {
    #[derive(Deserialize)]
    struct HandshakeResponse {
        #[serde(default)]
        error: Option<String>,
    }

    let response: HandshakeResponse =
        serde_json::from_str(record).map_err(|err| PushError::Protocol(format!("handshake response: {err}")))?;
    match response.error {
        Some(error) => Err(PushError::Handshake(error)),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation { target: String, arguments: Vec<Value> },
    Completion { invocation_id: Option<String>, error: Option<String> },
    Ping,
    Close { error: Option<String> },
    Other(u8),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HubMessage {
    pub fn parse(record: &str) -> Result<Self, PushError> {
        let raw: RawMessage =
            serde_json::from_str(record).map_err(|err| PushError::Protocol(format!("hub message: {err}")))?;
        Ok(match raw.kind {
            TYPE_INVOCATION => HubMessage::Invocation {
                target: raw.target.unwrap_or_default(),
                arguments: raw.arguments,
            },
            TYPE_COMPLETION => HubMessage::Completion {
                invocation_id: raw.invocation_id,
                error: raw.error,
            },
            TYPE_PING => HubMessage::Ping,
            TYPE_CLOSE => HubMessage::Close { error: raw.error },
            other => HubMessage::Other(other),
        })
    }
}

/// One field change pushed for a charger.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    /// Charger id.
    pub mid: String,
    /// Observation id.
    pub id: u16,
    pub data_type: u8,
    pub value: Value,
}

impl ProductUpdate {
    pub fn from_arguments(arguments: &[Value]) -> Result<Self, PushError> {
        let first = arguments
            .first()
            .ok_or_else(|| PushError::Protocol("ProductUpdate without arguments".to_string()))?;
        serde_json::from_value(first.clone()).map_err(|err| PushError::Protocol(format!("ProductUpdate: {err}")))
    }

    /// Values arrive as strings; anything else is read through its JSON text.
    pub fn raw_value(&self) -> String {
        match &self.value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: String,
    #[serde(default)]
    pub connection_token: Option<String>,
}

impl NegotiateResponse {
    /// The value the hub expects in the `id` query parameter.
    pub fn connection_key(&self) -> &str {
        self.connection_token.as_deref().unwrap_or(&self.connection_id)
    }
}
