//! Correlation-id tagged duplex exchange over one [`Framer`].
//!
//! Unary calls use a stream for exactly one send and one receive; streaming
//! calls hand the stream to the caller. Every send and receive races the
//! call context, so a fired deadline or cancellation interrupts a blocked
//! exchange. The first failure sticks: later operations return it again.

use std::fmt;

use futures_util::future::BoxFuture;
use stack_core::error::component;
use stack_core::{CallError, Message, MessageType, Payload, Request, END_OF_STREAM};

use crate::context::CallContext;
use crate::framer::Framer;

/// Invoked exactly once when the stream is closed, with the framer and the
/// error the stream ended with.
pub type Release = Box<dyn FnOnce(Framer, Option<CallError>) -> BoxFuture<'static, ()> + Send>;

/// One duplex exchange.
pub struct Stream {
    id: String,
    ctx: CallContext,
    role: MessageType,
    service: String,
    method: String,
    endpoint: String,
    framer: Option<Framer>,
    stream_marker: bool,
    send_eos: bool,
    raw: bool,
    finished: bool,
    error: Option<CallError>,
    release: Option<Release>,
}

impl Stream {
    /// Client side of an exchange for `request`, tagged with `id`.
    #[must_use]
    pub fn new(ctx: CallContext, request: &Request, id: impl Into<String>, framer: Framer) -> Self {
        Self {
            id: id.into(),
            ctx,
            role: MessageType::Request,
            service: request.service().to_string(),
            method: request.method().to_string(),
            endpoint: request.endpoint().to_string(),
            framer: Some(framer),
            stream_marker: false,
            send_eos: false,
            raw: request.wants_raw_response(),
            finished: false,
            error: None,
            release: None,
        }
    }

    /// Tags every frame with the stream marker and signals end of stream to
    /// the peer on a clean close.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.stream_marker = true;
        self.send_eos = true;
        self
    }

    /// Sends responses and receives requests instead.
    #[must_use]
    pub fn responder(mut self) -> Self {
        self.role = MessageType::Response;
        self
    }

    /// Replaces the default close behaviour (closing the framer).
    #[must_use]
    pub fn with_release(mut self, release: Release) -> Self {
        self.release = Some(release);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The error the stream failed with, if any.
    #[must_use]
    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    /// `true` once the peer signalled end of stream.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// `true` once [`Stream::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.framer.is_none()
    }

    /// Records `err` as the stream's failure unless one is already set.
    pub fn fail(&mut self, err: CallError) {
        self.error.get_or_insert(err);
    }

    fn message(&self) -> Message {
        let mut msg = Message::new(self.role);
        msg.id.clone_from(&self.id);
        msg.target.clone_from(&self.service);
        msg.method.clone_from(&self.method);
        msg.endpoint.clone_from(&self.endpoint);
        msg
    }

    fn check_open(&self) -> Result<(), CallError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.framer.is_none() {
            return Err(CallError::internal(component::CLIENT, "stream closed"));
        }
        Ok(())
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// The stream's sticky error, a context error, or the framing error of
    /// this send.
    pub async fn send(&mut self, body: &Payload) -> Result<(), CallError> {
        self.check_open()?;
        let mut msg = self.message();
        let marker = self.stream_marker.then_some(self.id.as_str());
        let Some(framer) = self.framer.as_mut() else {
            return Err(CallError::internal(component::CLIENT, "stream closed"));
        };
        let result = tokio::select! {
            biased;
            err = self.ctx.done() => Err(err),
            sent = framer.write(&mut msg, body, marker) => sent,
        };
        if let Err(err) = &result {
            self.error = Some(err.clone());
        }
        result
    }

    /// Receives one message. `Ok(None)` means the peer ended the stream
    /// cleanly; a peer error arrives as `CallError::Remote`.
    ///
    /// # Errors
    ///
    /// The stream's sticky error, a context error, a framing error or the
    /// peer's error.
    pub async fn recv(&mut self) -> Result<Option<Payload>, CallError> {
        if self.finished {
            return Ok(None);
        }
        self.check_open()?;
        let expected = match self.role {
            MessageType::Request => MessageType::Response,
            _ => MessageType::Request,
        };
        let raw = self.raw;
        let Some(framer) = self.framer.as_mut() else {
            return Err(CallError::internal(component::CLIENT, "stream closed"));
        };

        let mut msg = Message::default();
        let header = tokio::select! {
            biased;
            err = self.ctx.done() => Err(err),
            read = framer.read_header(&mut msg, expected) => read,
        };
        let result = header.and_then(|()| {
            if msg.is_end_of_stream() {
                let _ = framer.read_body(&msg, true);
                return Ok(None);
            }
            if !msg.error.is_empty() {
                let _ = framer.read_body(&msg, true);
                return Err(CallError::remote(&msg.error));
            }
            framer.read_body(&msg, raw).map(Some)
        });
        match &result {
            Ok(None) => self.finished = true,
            Ok(Some(_)) => {}
            Err(err) => self.error = Some(err.clone()),
        }
        result
    }

    /// Ends the exchange. The release callback (or, without one, the
    /// framer's own close) runs exactly once however often this is called.
    ///
    /// # Errors
    ///
    /// Returns the failure of signalling end of stream or of closing the
    /// framer.
    pub async fn close(&mut self) -> Result<(), CallError> {
        let Some(mut framer) = self.framer.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if self.send_eos && self.error.is_none() {
            let mut msg = self.message();
            msg.error = END_OF_STREAM.to_string();
            let marker = self.stream_marker.then_some(self.id.as_str());
            if let Err(err) = framer.write(&mut msg, &Payload::Raw(Vec::new()), marker).await {
                self.error = Some(err.clone());
                result = Err(err);
            }
        }
        match self.release.take() {
            Some(release) => release(framer, self.error.clone()).await,
            None => result = result.and(framer.close().await),
        }
        result
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("service", &self.service)
            .field("endpoint", &self.endpoint)
            .field("finished", &self.finished)
            .field("closed", &self.framer.is_none())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use stack_core::codec::content_type;
    use stack_core::types::{DEFAULT_PROTOCOL, PROTOCOL_METADATA_KEY};
    use stack_core::{CodecRegistry, ErrorKind, Node};

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use crate::transport::{DialOptions, MemoryTransport};

    fn node() -> Node {
        Node::new("n", "peer").with_metadata(PROTOCOL_METADATA_KEY, DEFAULT_PROTOCOL)
    }

    fn request() -> Request {
        Request::new("foo", "Foo.Stream", Payload::empty())
    }

    /// Connected client/peer framers over the memory transport.
    async fn framers() -> (Framer, Framer) {
        let codecs = CodecRegistry::default();
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("peer").unwrap();
        let pool = Pool::new(Arc::new(transport), PoolConfig::default());
        let conn = pool.get("peer", &DialOptions::default()).await.unwrap();
        let server = pool.adopt(Box::new(listener.accept().await.unwrap()));
        let none = HashMap::new();
        (
            Framer::new(conn, &codecs, &node(), content_type::JSON, None, &none).unwrap(),
            Framer::new(server, &codecs, &node(), content_type::JSON, None, &none).unwrap(),
        )
    }

    #[tokio::test]
    async fn exchange_and_end_of_stream() {
        let (client, server) = framers().await;
        let mut client = Stream::new(CallContext::new(), &request(), "7", client).streaming();
        let mut server = Stream::new(CallContext::new(), &request(), "7", server)
            .streaming()
            .responder();

        client.send(&json!({"n": 1}).into()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(json!({"n": 1}).into()));
        server.send(&json!({"n": 2}).into()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(json!({"n": 2}).into()));

        server.close().await.unwrap();
        assert_eq!(client.recv().await.unwrap(), None);
        assert!(client.is_finished());
        assert_eq!(client.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn peer_error_surfaces_as_remote_and_sticks() {
        let (client, mut server) = framers().await;
        let mut client = Stream::new(CallContext::new(), &request(), "1", client);

        let mut reply = Message::new(MessageType::Response);
        reply.id = "1".into();
        reply.error = r#"{"id":"foo","code":409,"detail":"conflict"}"#.into();
        server.write(&mut reply, &Payload::empty(), None).await.unwrap();

        let err = client.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
        assert_eq!(err.status_code(), 409);
        assert_eq!(client.send(&Payload::empty()).await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn close_releases_exactly_once() {
        let (client, _server) = framers().await;
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut stream = Stream::new(CallContext::new(), &request(), "1", client).with_release(
            Box::new(
                move |framer: Framer, err: Option<CallError>| -> BoxFuture<'static, ()> {
                    Box::pin(async move {
                        assert!(err.is_none());
                        counter.fetch_add(1, Ordering::SeqCst);
                        drop(framer);
                    })
                },
            ),
        );

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(stream.is_closed());
        assert!(stream.send(&Payload::empty()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_blocked_recv() {
        let (client, _server) = framers().await;
        let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
        let mut stream = Stream::new(ctx, &request(), "1", client);

        let err = stream.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(stream.error(), Some(&err));
    }
}
