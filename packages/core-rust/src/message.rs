//! Logical messages, wire frames and payload bodies.
//!
//! A [`Frame`] is what travels over a transport connection: a flat string
//! header map plus an opaque byte body. A [`Message`] is the logical view a
//! codec reads and writes: correlation id, target, method, error text and the
//! header map. [`Payload`] is a body that is either already raw bytes (never
//! re-encoded) or a structured value the negotiated codec marshals.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header keys carried on every frame.
pub mod header {
    /// Request timeout in nanoseconds, decimal string.
    pub const TIMEOUT: &str = "Timeout";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const ACCEPT: &str = "Accept";
    /// Correlation id.
    pub const ID: &str = "Stack-Id";
    /// Target service name.
    pub const SERVICE: &str = "Stack-Service";
    pub const METHOD: &str = "Stack-Method";
    pub const ENDPOINT: &str = "Stack-Endpoint";
    /// Error text returned by the peer.
    pub const ERROR: &str = "Stack-Error";
    /// Stream marker: the stream id when the frame belongs to a stream.
    pub const STREAM: &str = "Stack-Stream";
    /// Topic of a broker publication.
    pub const TOPIC: &str = "Stack-Topic";
}

/// Error text a peer sends to signal a clean end of stream.
pub const END_OF_STREAM: &str = "EOS";

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One transport frame: `{header map, byte body}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Frame {
    pub header: HashMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(header: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Returns a header value, treating empty strings as absent.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Role of a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    #[default]
    Request,
    Response,
    Event,
    Error,
}

/// Logical message exchanged through a codec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Correlation id.
    pub id: String,
    pub message_type: MessageType,
    /// Target service (or topic for events).
    pub target: String,
    pub method: String,
    pub endpoint: String,
    /// Error text; empty when the message carries no error.
    pub error: String,
    pub header: HashMap<String, String>,
}

impl Message {
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Self::default()
        }
    }

    /// Copies header-carried fields onto the message where the codec did not
    /// already supply them. Codec-decoded values always win.
    pub fn restore_from_header(&mut self) {
        fn fill(field: &mut String, header: &HashMap<String, String>, key: &str) {
            if field.is_empty() {
                if let Some(v) = header.get(key) {
                    field.clone_from(v);
                }
            }
        }

        fill(&mut self.error, &self.header, header::ERROR);
        fill(&mut self.endpoint, &self.header, header::ENDPOINT);
        fill(&mut self.method, &self.header, header::METHOD);
        fill(&mut self.id, &self.header, header::ID);
        fill(&mut self.target, &self.header, header::SERVICE);
    }

    /// Writes the non-empty message fields into the header map, plus the
    /// stream marker when `stream_id` is set.
    pub fn apply_to_header(&mut self, stream_id: Option<&str>) {
        let fields = [
            (header::ID, &self.id),
            (header::SERVICE, &self.target),
            (header::METHOD, &self.method),
            (header::ENDPOINT, &self.endpoint),
            (header::ERROR, &self.error),
        ];
        for (key, value) in fields {
            if !value.is_empty() {
                self.header.insert(key.to_string(), value.clone());
            }
        }
        if let Some(stream) = stream_id.filter(|s| !s.is_empty()) {
            self.header.insert(header::STREAM.to_string(), stream.to_string());
        }
    }

    /// Returns `true` if the peer signalled a clean end of stream.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.error == END_OF_STREAM
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Pre-encoded bytes; written to the wire untouched.
    Raw(Vec<u8>),
    /// Structured value marshalled by the negotiated codec.
    Value(serde_json::Value),
}

impl Payload {
    /// An empty structured body (`null`).
    #[must_use]
    pub fn empty() -> Self {
        Self::Value(serde_json::Value::Null)
    }

    /// Builds a structured payload from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if `value` cannot be represented.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Value)
    }

    /// Decodes the payload into `T`. Raw payloads are parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Raw(bytes) => serde_json::from_slice(bytes),
            Self::Value(value) => T::deserialize(value),
        }
    }

    /// Returns the raw bytes if this is a raw payload.
    #[must_use]
    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            Self::Value(_) => None,
        }
    }

    /// Returns the structured value if this is a value payload.
    #[must_use]
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Raw(_) => None,
            Self::Value(value) => Some(value),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
