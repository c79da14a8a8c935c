//! Message codec.
//!
//! Translates between channel payloads and the bytes handed to a connection.
//! Two modes exist and the caller picks one per call, so a channel can flip
//! modes between sends:
//!
//! - **raw**: bytes pass through unchanged; scalar JSON values are written
//!   as their plain text.
//! - **structured**: values are serialized to JSON on send and parsed back on
//!   receive.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{ChannelError, Result};

/// A message payload as seen by channel users.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes (raw mode).
    Raw(Bytes),
    /// A structured value (structured mode).
    Value(Value),
}

impl Payload {
    /// Build a structured payload from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Value(serde_json::to_value(value)?))
    }

    /// The raw bytes, if this is a raw payload.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Value(_) => None,
        }
    }

    /// The raw bytes as UTF-8 text, if this is a raw, valid UTF-8 payload.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// The structured value, if this is a structured payload.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Deserialize a structured payload into a typed value.
    ///
    /// Raw payloads are parsed as JSON text.
    pub fn decode_into<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Payload::Value(value) => Ok(T::deserialize(value)?),
            Payload::Raw(bytes) => serde_json::from_slice(bytes).map_err(ChannelError::Decode),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Raw(value)
    }
}

impl From<&'static str> for Payload {
    fn from(value: &'static str) -> Self {
        Payload::Raw(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Raw(Bytes::from(value))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(value))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

/// Encode an outbound payload for the wire.
pub fn encode(payload: Payload, raw: bool) -> Result<Bytes> {
    // ---
    match (payload, raw) {
        (Payload::Raw(bytes), true) => Ok(bytes),
        (Payload::Value(value), true) => encode_scalar(value),
        (Payload::Value(value), false) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        (Payload::Raw(bytes), false) => {
            let text = std::str::from_utf8(&bytes).map_err(|err| {
                ChannelError::Encode(format!("raw payload is not UTF-8 text: {err}"))
            })?;
            Ok(Bytes::from(serde_json::to_vec(text)?))
        }
    }
}

/// Decode an inbound wire payload.
pub fn decode(bytes: Bytes, raw: bool) -> Result<Payload> {
    // ---
    if raw {
        return Ok(Payload::Raw(bytes));
    }
    serde_json::from_slice(&bytes)
        .map(Payload::Value)
        .map_err(ChannelError::Decode)
}

// Raw mode carries scalars only; containers have no plain-text form.
fn encode_scalar(value: Value) -> Result<Bytes> {
    match value {
        Value::String(text) => Ok(Bytes::from(text)),
        Value::Number(number) => Ok(Bytes::from(number.to_string())),
        Value::Bool(flag) => Ok(Bytes::from(flag.to_string())),
        other => Err(ChannelError::Encode(format!(
            "raw mode accepts scalars only, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
