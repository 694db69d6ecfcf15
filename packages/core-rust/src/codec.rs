//! Payload codecs, the codec registry and legacy protocol negotiation.
//!
//! A codec marshals a structured body (and, for envelope formats such as the
//! legacy JSON-RPC codec, the message header fields) into the byte body of a
//! frame, and back. Codecs are stateless and shared behind `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageType, Payload};
use crate::types::Node;

/// Well-known content types.
pub mod content_type {
    pub const JSON: &str = "application/json";
    pub const JSON_RPC: &str = "application/json-rpc";
    pub const PROTOBUF: &str = "application/protobuf";
    pub const PROTO_RPC: &str = "application/proto-rpc";
    pub const MSGPACK: &str = "application/msgpack";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}

/// Errors raised while encoding or decoding a body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("close failed: {0}")]
    Close(String),
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// Marshaler bound to one content type.
pub trait Codec: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Encodes `body` (and any envelope fields taken from `msg`).
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the body cannot be represented.
    fn encode(&self, msg: &Message, body: &Value) -> Result<Vec<u8>, CodecError>;

    /// Restores envelope-carried fields of `msg` from a frame body. Codecs
    /// without an envelope leave the message untouched.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the envelope is malformed.
    fn decode_header(&self, msg: &mut Message, data: &[u8]) -> Result<(), CodecError> {
        let _ = (msg, data);
        Ok(())
    }

    /// Decodes the body part of a frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the body is malformed.
    fn decode_body(&self, data: &[u8], message_type: MessageType) -> Result<Payload, CodecError>;

    /// Releases codec resources.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Close` if cleanup fails.
    fn close(&self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Codec").field(&self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Plain JSON bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, _msg: &Message, body: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(body).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_body(&self, data: &[u8], _message_type: MessageType) -> Result<Payload, CodecError> {
        if data.is_empty() {
            return Ok(Payload::empty());
        }
        serde_json::from_slice(data)
            .map(Payload::Value)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Legacy JSON-RPC
// ---------------------------------------------------------------------------

/// Legacy JSON-RPC envelope: requests carry `{method, params: [body], id}`,
/// responses carry `{id, result, error}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcCodec;

#[derive(Debug, Serialize, Deserialize)]
struct RpcRequestEnvelope {
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcResponseEnvelope {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

fn id_to_value(id: &str) -> Value {
    id.parse::<u64>()
        .map_or_else(|_| Value::String(id.to_string()), Value::from)
}

fn id_from_value(id: &Value) -> String {
    match id {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl JsonRpcCodec {
    fn is_request(message_type: MessageType) -> bool {
        matches!(message_type, MessageType::Request)
    }
}

impl Codec for JsonRpcCodec {
    fn name(&self) -> &'static str {
        "json-rpc"
    }

    fn encode(&self, msg: &Message, body: &Value) -> Result<Vec<u8>, CodecError> {
        let encoded = match msg.message_type {
            MessageType::Request => serde_json::to_vec(&RpcRequestEnvelope {
                method: if msg.method.is_empty() {
                    msg.endpoint.clone()
                } else {
                    msg.method.clone()
                },
                params: vec![body.clone()],
                id: id_to_value(&msg.id),
            }),
            MessageType::Response | MessageType::Error => {
                serde_json::to_vec(&RpcResponseEnvelope {
                    id: id_to_value(&msg.id),
                    result: if msg.error.is_empty() {
                        body.clone()
                    } else {
                        Value::Null
                    },
                    error: if msg.error.is_empty() {
                        Value::Null
                    } else {
                        Value::String(msg.error.clone())
                    },
                })
            }
            MessageType::Event => serde_json::to_vec(body),
        };
        encoded.map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_header(&self, msg: &mut Message, data: &[u8]) -> Result<(), CodecError> {
        if data.is_empty() || msg.message_type == MessageType::Event {
            return Ok(());
        }
        if Self::is_request(msg.message_type) {
            let env: RpcRequestEnvelope =
                serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?;
            msg.method = env.method;
            msg.id = id_from_value(&env.id);
        } else {
            let env: RpcResponseEnvelope =
                serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?;
            msg.id = id_from_value(&env.id);
            msg.error = match env.error {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            };
        }
        Ok(())
    }

    fn decode_body(&self, data: &[u8], message_type: MessageType) -> Result<Payload, CodecError> {
        if data.is_empty() {
            return Ok(Payload::empty());
        }
        let value = match message_type {
            MessageType::Request => {
                let env: RpcRequestEnvelope = serde_json::from_slice(data)
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                env.params.into_iter().next().unwrap_or(Value::Null)
            }
            MessageType::Response | MessageType::Error => {
                let env: RpcResponseEnvelope = serde_json::from_slice(data)
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                env.result
            }
            MessageType::Event => {
                serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?
            }
        };
        Ok(Payload::Value(value))
    }
}

// ---------------------------------------------------------------------------
// MessagePack
// ---------------------------------------------------------------------------

/// `MsgPack` bodies with named maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, _msg: &Message, body: &Value) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(body).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_body(&self, data: &[u8], _message_type: MessageType) -> Result<Payload, CodecError> {
        if data.is_empty() {
            return Ok(Payload::empty());
        }
        rmp_serde::from_slice::<Value>(data)
            .map(Payload::Value)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Raw bytes
// ---------------------------------------------------------------------------

/// Opaque bytes. Only raw payloads can be written.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, _msg: &Message, _body: &Value) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unsupported(
            "octet-stream bodies must be raw payloads".to_string(),
        ))
    }

    fn decode_body(&self, data: &[u8], _message_type: MessageType) -> Result<Payload, CodecError> {
        Ok(Payload::Raw(data.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// CodecRegistry
// ---------------------------------------------------------------------------

/// Content type -> codec lookup table. `Default` registers the built-ins.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// An empty registry with no codecs at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers (or replaces) the codec for `content_type`.
    pub fn register(&mut self, content_type: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.insert(content_type.into(), codec);
    }

    /// Looks up the codec for `content_type`.
    #[must_use]
    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(content_type).cloned()
    }

    #[must_use]
    pub fn contains(&self, content_type: &str) -> bool {
        self.codecs.contains_key(content_type)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(content_type::JSON, Arc::new(JsonCodec));
        registry.register(content_type::JSON_RPC, Arc::new(JsonRpcCodec));
        registry.register(content_type::MSGPACK, Arc::new(MsgPackCodec));
        registry.register(content_type::OCTET_STREAM, Arc::new(RawCodec));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.codecs.keys().collect();
        keys.sort();
        f.debug_struct("CodecRegistry").field("codecs", &keys).finish()
    }
}

// ---------------------------------------------------------------------------
// Protocol negotiation
// ---------------------------------------------------------------------------

/// Wire dialect used towards one node, resolved once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// The node declares a protocol (or the message is a publication):
    /// the request content type is used as is.
    Default,
    /// Legacy peer, JSON bodies travel as JSON-RPC envelopes.
    LegacyJson,
    /// Legacy peer, protobuf bodies travel as proto-RPC envelopes.
    LegacyProto,
}

/// Outcome of [`Protocol::negotiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: Protocol,
    /// Content type to put on the wire and to pick the codec with.
    pub content_type: String,
}

impl Protocol {
    /// Decides the wire dialect for `node`.
    ///
    /// Nodes that declare no protocol are assumed to be older peers, and the
    /// generic JSON/protobuf content types are remapped to their legacy RPC
    /// flavours. Publications are never remapped.
    #[must_use]
    pub fn negotiate(node: &Node, content_type: &str, publishing: bool) -> Negotiated {
        let protocol = if node.protocol().is_some() || publishing {
            Protocol::Default
        } else {
            match content_type {
                content_type::JSON => Protocol::LegacyJson,
                content_type::PROTOBUF => Protocol::LegacyProto,
                _ => Protocol::Default,
            }
        };
        Negotiated {
            protocol,
            content_type: protocol.wire_content_type(content_type).to_string(),
        }
    }

    /// Content type used on the wire for a request declared as `requested`.
    #[must_use]
    pub fn wire_content_type<'a>(&self, requested: &'a str) -> &'a str {
        match self {
            Protocol::Default => requested,
            Protocol::LegacyJson => content_type::JSON_RPC,
            Protocol::LegacyProto => content_type::PROTO_RPC,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
