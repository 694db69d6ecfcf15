//! TCP transport: length-delimited frames, each a MsgPack-encoded [`Frame`].

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use stack_core::Frame;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{Connection, DialOptions, Transport, TransportError};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Dials plain TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Binds a listener on `address` (use port 0 for an ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the address cannot be bound.
    pub async fn listen(&self, address: &str) -> Result<TcpListener, TransportError> {
        let inner = tokio::net::TcpListener::bind(address).await?;
        Ok(TcpListener { inner })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        address: &str,
        options: &DialOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::DialTimeout(options.timeout))?
            .map_err(|e| match e.kind() {
                io::ErrorKind::ConnectionRefused => {
                    TransportError::ConnectionRefused(address.to_string())
                }
                _ => TransportError::from(e),
            })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection::new(stream, address.to_string())))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

// ---------------------------------------------------------------------------
// TcpListener
// ---------------------------------------------------------------------------

/// Accept side of the TCP transport.
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

impl TcpListener {
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// Waits for the next inbound connection.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if accepting fails.
    pub async fn accept(&self) -> Result<TcpConnection, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::new(stream, peer.to_string()))
    }
}

// ---------------------------------------------------------------------------
// TcpConnection
// ---------------------------------------------------------------------------

/// One framed TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    remote: String,
    closed: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream, remote: String) -> Self {
        Self {
            framed: Framed::new(stream, frame_codec()),
            remote,
            closed: false,
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let encoded =
            rmp_serde::to_vec_named(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.framed.send(Bytes::from(encoded)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.framed.next().await {
            None => Err(TransportError::Closed),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(buf)) => {
                rmp_serde::from_slice(&buf).map_err(|e| TransportError::Codec(e.to_string()))
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_localhost() {
        let transport = TcpTransport::new();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let frame = conn.recv().await.unwrap();
            conn.send(&frame).await.unwrap();
            // Peer closes after the echo.
            assert_eq!(conn.recv().await, Err(TransportError::Closed));
        });

        let mut client = transport
            .dial(&address, &DialOptions::default())
            .await
            .unwrap();
        let frame = Frame::new(
            HashMap::from([("Content-Type".into(), "application/json".into())]),
            br#"{"a":1}"#.to_vec(),
        );
        client.send(&frame).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), frame);
        client.close().await.unwrap();
        assert_eq!(client.recv().await, Err(TransportError::Closed));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_is_classified() {
        let transport = TcpTransport::new();
        // Bind then drop to get a port nobody listens on.
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = transport
            .dial(&address, &DialOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }
}
