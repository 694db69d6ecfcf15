//! Codec framer: one logical message to one wire frame on one connection.
//!
//! The framer is created per attempt for a chosen node. It negotiates the
//! wire dialect once, picks the codec for the resulting content type and
//! keeps the connection-scoped headers (timeout, content type, accept and
//! the caller's metadata). Every write merges those with the message
//! fields; every read restores message fields from the frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stack_core::error::component;
use stack_core::message::header;
use stack_core::{
    CallError, Codec, CodecRegistry, Frame, Message, MessageType, Negotiated, Node, Payload,
    Protocol,
};

use crate::pool::PooledConnection;

/// Frames logical messages onto a [`PooledConnection`].
#[derive(Debug)]
pub struct Framer {
    conn: PooledConnection,
    codec: Arc<dyn Codec>,
    negotiated: Negotiated,
    header: HashMap<String, String>,
    pending: Option<Frame>,
}

impl Framer {
    /// Binds `conn` to the codec negotiated for `node`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Protocol` if no codec is registered for the
    /// negotiated content type. The connection is handed back in that case
    /// so the caller can release it.
    pub fn new(
        conn: PooledConnection,
        codecs: &CodecRegistry,
        node: &Node,
        content_type: &str,
        timeout: Option<Duration>,
        metadata: &HashMap<String, String>,
    ) -> Result<Self, (CallError, PooledConnection)> {
        let negotiated = Protocol::negotiate(node, content_type, false);
        let Some(codec) = codecs.get(&negotiated.content_type) else {
            let err = CallError::protocol(
                component::CODEC,
                format!("unsupported content type: {}", negotiated.content_type),
            );
            return Err((err, conn));
        };

        let mut header = metadata.clone();
        if let Some(timeout) = timeout {
            header.insert(header::TIMEOUT.to_string(), timeout.as_nanos().to_string());
        }
        header.insert(header::CONTENT_TYPE.to_string(), negotiated.content_type.clone());
        header.insert(header::ACCEPT.to_string(), negotiated.content_type.clone());

        Ok(Self {
            conn,
            codec,
            negotiated,
            header,
            pending: None,
        })
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.negotiated.protocol
    }

    /// Content type used on the wire.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.negotiated.content_type
    }

    #[must_use]
    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }

    /// Writes `msg` with `body` as exactly one frame. Raw payloads are sent
    /// untouched; structured ones go through the codec.
    ///
    /// # Errors
    ///
    /// `Protocol` if encoding fails, `Connection` if the send fails.
    pub async fn write(
        &mut self,
        msg: &mut Message,
        body: &Payload,
        stream_id: Option<&str>,
    ) -> Result<(), CallError> {
        msg.header
            .extend(self.header.iter().map(|(k, v)| (k.clone(), v.clone())));
        msg.apply_to_header(stream_id);

        let bytes = match body {
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Value(value) => self
                .codec
                .encode(msg, value)
                .map_err(|e| CallError::protocol(component::CODEC, e))?,
        };

        let frame = Frame::new(msg.header.clone(), bytes);
        self.conn
            .send(&frame)
            .await
            .map_err(|e| CallError::connection(component::TRANSPORT, e))
    }

    /// Receives one frame and restores the header fields of `msg` from it.
    /// The body stays buffered for [`Framer::read_body`].
    ///
    /// # Errors
    ///
    /// `Connection` if the receive fails, `Protocol` if the envelope cannot
    /// be decoded.
    pub async fn read_header(
        &mut self,
        msg: &mut Message,
        message_type: MessageType,
    ) -> Result<(), CallError> {
        let frame = self
            .conn
            .recv()
            .await
            .map_err(|e| CallError::connection(component::TRANSPORT, e))?;

        msg.message_type = message_type;
        msg.header.clone_from(&frame.header);
        let decoded = self.codec.decode_header(msg, &frame.body);
        msg.restore_from_header();
        self.pending = Some(frame);
        decoded.map_err(|e| CallError::protocol(component::CODEC, e))
    }

    /// Decodes the body buffered by the last `read_header`. With `raw` the
    /// bytes are returned undecoded.
    ///
    /// # Errors
    ///
    /// `Protocol` if there is no buffered frame or decoding fails.
    pub fn read_body(&mut self, msg: &Message, raw: bool) -> Result<Payload, CallError> {
        let frame = self
            .pending
            .take()
            .ok_or_else(|| CallError::protocol(component::CODEC, "no frame to read body from"))?;
        if raw {
            return Ok(Payload::Raw(frame.body));
        }
        self.codec
            .decode_body(&frame.body, msg.message_type)
            .map_err(|e| CallError::protocol(component::CODEC, e))
    }

    /// Hands the connection back, e.g. to return it to the pool.
    #[must_use]
    pub fn into_connection(self) -> PooledConnection {
        self.conn
    }

    /// Closes the codec, then the connection. Both steps run; the first
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the cleanup steps.
    pub async fn close(mut self) -> Result<(), CallError> {
        self.pending = None;
        let codec = self
            .codec
            .close()
            .map_err(|e| CallError::protocol(component::CODEC, e));
        let conn = self
            .conn
            .close()
            .await
            .map_err(|e| CallError::connection(component::TRANSPORT, e));
        codec.and(conn)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stack_core::codec::content_type;
    use stack_core::types::{DEFAULT_PROTOCOL, PROTOCOL_METADATA_KEY};

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use crate::transport::{DialOptions, MemoryListener, MemoryTransport};

    async fn connect() -> (Pool, MemoryListener, PooledConnection) {
        let transport = MemoryTransport::new();
        let listener = transport.listen("peer").unwrap();
        let pool = Pool::new(Arc::new(transport), PoolConfig::default());
        let conn = pool.get("peer", &DialOptions::default()).await.unwrap();
        (pool, listener, conn)
    }

    async fn peer_framer(
        listener: &mut MemoryListener,
        codecs: &CodecRegistry,
        node: &Node,
    ) -> Framer {
        let server = listener.accept().await.unwrap();
        let pool = Pool::new(Arc::new(MemoryTransport::new()), PoolConfig::default());
        let conn = pool.adopt(Box::new(server));
        Framer::new(conn, codecs, node, content_type::JSON, None, &HashMap::new()).unwrap()
    }

    fn request_message() -> Message {
        let mut msg = Message::new(MessageType::Request);
        msg.id = "1".into();
        msg.target = "foo".into();
        msg.method = "Foo.Bar".into();
        msg.endpoint = "Foo.Bar".into();
        msg
    }

    #[tokio::test]
    async fn legacy_node_round_trip_uses_json_rpc() {
        let codecs = CodecRegistry::default();
        let node = Node::new("n", "peer");
        let (_pool, mut listener, conn) = connect().await;
        let metadata = HashMap::from([("Trace".to_string(), "abc".to_string())]);
        let mut client = Framer::new(
            conn,
            &codecs,
            &node,
            content_type::JSON,
            Some(Duration::from_secs(2)),
            &metadata,
        )
        .unwrap();
        assert_eq!(client.protocol(), Protocol::LegacyJson);
        let mut server = peer_framer(&mut listener, &codecs, &node).await;

        let body = Payload::from(json!({"name": "john"}));
        client
            .write(&mut request_message(), &body, None)
            .await
            .unwrap();

        let mut received = Message::default();
        server
            .read_header(&mut received, MessageType::Request)
            .await
            .unwrap();
        assert_eq!(received.id, "1");
        assert_eq!(received.target, "foo");
        assert_eq!(received.method, "Foo.Bar");
        assert_eq!(received.endpoint, "Foo.Bar");
        assert_eq!(received.header.get("Trace").map(String::as_str), Some("abc"));
        assert_eq!(
            received.header.get(header::CONTENT_TYPE).map(String::as_str),
            Some(content_type::JSON_RPC)
        );
        assert_eq!(
            received.header.get(header::TIMEOUT).map(String::as_str),
            Some("2000000000")
        );
        assert_eq!(server.read_body(&received, false).unwrap(), body);
    }

    #[tokio::test]
    async fn declared_protocol_keeps_content_type_and_raw_bodies_pass_through() {
        let codecs = CodecRegistry::default();
        let node = Node::new("n", "peer").with_metadata(PROTOCOL_METADATA_KEY, DEFAULT_PROTOCOL);
        let (_pool, mut listener, conn) = connect().await;
        let mut client =
            Framer::new(conn, &codecs, &node, content_type::JSON, None, &HashMap::new()).unwrap();
        assert_eq!(client.content_type(), content_type::JSON);
        let mut server = peer_framer(&mut listener, &codecs, &node).await;

        let raw = Payload::Raw(br#"{"pre":"encoded"}"#.to_vec());
        client.write(&mut request_message(), &raw, Some("1")).await.unwrap();

        let mut received = Message::default();
        server
            .read_header(&mut received, MessageType::Request)
            .await
            .unwrap();
        assert_eq!(
            received.header.get(header::STREAM).map(String::as_str),
            Some("1")
        );
        assert_eq!(server.read_body(&received, true).unwrap(), raw);
    }

    #[tokio::test]
    async fn response_error_is_restored_from_header() {
        let codecs = CodecRegistry::default();
        let node = Node::new("n", "peer").with_metadata(PROTOCOL_METADATA_KEY, DEFAULT_PROTOCOL);
        let (_pool, mut listener, conn) = connect().await;
        let mut client =
            Framer::new(conn, &codecs, &node, content_type::JSON, None, &HashMap::new()).unwrap();
        let mut server = peer_framer(&mut listener, &codecs, &node).await;

        let mut reply = Message::new(MessageType::Response);
        reply.id = "1".into();
        reply.error = "boom".into();
        server.write(&mut reply, &Payload::empty(), None).await.unwrap();

        let mut received = Message::default();
        client
            .read_header(&mut received, MessageType::Response)
            .await
            .unwrap();
        assert_eq!(received.error, "boom");
        assert_eq!(received.id, "1");
    }

    #[tokio::test]
    async fn unknown_content_type_is_protocol_error() {
        let codecs = CodecRegistry::default();
        let node = Node::new("n", "peer");
        let (_pool, _listener, conn) = connect().await;
        let (err, _conn) = Framer::new(
            conn,
            &codecs,
            &node,
            content_type::PROTOBUF,
            None,
            &HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), stack_core::ErrorKind::Protocol);
        assert!(err.to_string().contains(content_type::PROTO_RPC));
    }

    #[tokio::test]
    async fn read_body_without_header_fails() {
        let codecs = CodecRegistry::default();
        let node = Node::new("n", "peer");
        let (_pool, _listener, conn) = connect().await;
        let mut framer =
            Framer::new(conn, &codecs, &node, content_type::JSON, None, &HashMap::new()).unwrap();
        let err = framer.read_body(&Message::default(), false).unwrap_err();
        assert_eq!(err.kind(), stack_core::ErrorKind::Protocol);
        framer.close().await.unwrap();
    }
}
