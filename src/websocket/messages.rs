//! WebSocket Message Types
//!
//! Defines the wire envelope exchanged between peers. Every text frame
//! carries exactly one envelope:
//!
//! ```json
//! { "nombre": "<event-name>", "params": { "key": "value" } }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Free-form event payload.
///
/// Values are the dynamic JSON value type (null, bool, number, string,
/// array, object); handlers are responsible for checking the shapes they need.
pub type Payload = Map<String, Value>;

/// A named event plus its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, never empty
    #[serde(rename = "nombre")]
    pub event: String,
    /// Event parameters (an absent or `null` field decodes as empty)
    #[serde(rename = "params", default, deserialize_with = "null_as_empty")]
    pub payload: Payload,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    /// Create an envelope from an event name and payload
    pub fn new(event: impl Into<String>, payload: Payload) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Build an envelope from any serializable value.
    ///
    /// The value must serialize to a JSON object.
    pub fn from_serializable<T: Serialize + ?Sized>(
        event: impl Into<String>,
        value: &T,
    ) -> Result<Self, EnvelopeError> {
        match serde_json::to_value(value)? {
            Value::Object(payload) => Ok(Self::new(event, payload)),
            other => Err(EnvelopeError::PayloadNotObject(json_kind(&other))),
        }
    }

    /// Decode an envelope from a text frame
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.event.is_empty() {
            return Err(EnvelopeError::EmptyEvent);
        }
        Ok(envelope)
    }

    /// Encode the envelope as a text frame
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        if self.event.is_empty() {
            return Err(EnvelopeError::EmptyEvent);
        }
        Ok(serde_json::to_string(self)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Errors produced while encoding or decoding envelopes
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event name must not be empty")]
    EmptyEvent,

    #[error("Payload must serialize to an object, got {0}")]
    PayloadNotObject(&'static str),
}
