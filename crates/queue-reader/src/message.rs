//! Decoded queue messages and the blob references they carry.
//!
//! Every adapter turns its backend-specific wire body into a [`Message`], a JSON
//! object with the shape
//!
//! ```json
//! {
//!   "payload": { "key": "recordings/cam1/1700000000.mp4" },
//!   "source": "s3-eu",
//!   "data": { "uri": "https://vault.example.com/api" }
//! }
//! ```
//!
//! Only the top-level object shape is enforced while decoding. Missing `payload.key`
//! or `source` fields are detected later by [`Message::blob_reference`], so a
//! message that cannot be hydrated is skipped by the reader instead of being lost
//! inside the adapter.

use crate::error::{HydrationError, MessageError};
use serde_json::{Map, Value};

/// A structured message decoded from a broker's wire body
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    body: Map<String, Value>,
}

impl Message {
    /// Decode a wire body, requiring the top-level value to be a JSON object
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(MessageError::Empty);
        }

        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(body) => Ok(Self { body }),
            other => Err(MessageError::NotAnObject {
                found: json_type_name(&other),
            }),
        }
    }

    /// Wrap an already-parsed JSON object
    pub fn from_map(body: Map<String, Value>) -> Self {
        Self { body }
    }

    /// The `payload` mapping, if present and an object
    pub fn payload(&self) -> Option<&Map<String, Value>> {
        self.body.get("payload").and_then(Value::as_object)
    }

    /// The `source` storage partition, if present and a string
    pub fn source(&self) -> Option<&str> {
        self.body.get("source").and_then(Value::as_str)
    }

    /// Storage topology metadata carried in `data`
    pub fn storage_metadata(&self) -> Option<&Value> {
        self.body.get("data")
    }

    /// Build the blob reference from `payload.key` and `source`
    pub fn blob_reference(&self) -> Result<BlobReference, HydrationError> {
        let key = self
            .payload()
            .and_then(|payload| payload.get("key"))
            .and_then(Value::as_str)
            .ok_or(HydrationError::MissingField {
                field: "payload.key",
            })?;

        let source = self
            .source()
            .ok_or(HydrationError::MissingField { field: "source" })?;

        Ok(BlobReference {
            key: key.to_string(),
            source: source.to_string(),
        })
    }

    /// Full decoded body
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Consume the message and return its decoded body
    pub fn into_map(self) -> Map<String, Value> {
        self.body
    }
}

/// Address of a blob in the external storage service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReference {
    pub key: String,
    pub source: String,
}

impl std::fmt::Display for BlobReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source, self.key)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
