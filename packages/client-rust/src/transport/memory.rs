//! Channel-backed transport for in-process peers and tests.
//!
//! Listeners register under a logical address. Dialing that address creates
//! a pair of unbounded channels and hands the peer end to the listener.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use stack_core::Frame;
use tokio::sync::mpsc;

use super::{Connection, DialOptions, Transport, TransportError};

#[derive(Debug, Default)]
struct Shared {
    listeners: DashMap<String, mpsc::UnboundedSender<MemoryConnection>>,
    dials: AtomicUsize,
}

/// In-process transport. Clones share the same address space.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts accepting connections on `address`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AddressInUse` if a live listener already
    /// holds the address.
    pub fn listen(&self, address: &str) -> Result<MemoryListener, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.shared.listeners.entry(address.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return Err(TransportError::AddressInUse(address.to_string()));
                }
                occupied.insert(tx);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        Ok(MemoryListener {
            address: address.to_string(),
            incoming: rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Number of successful dials so far.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.shared.dials.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(
        &self,
        address: &str,
        _options: &DialOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let refused = || TransportError::ConnectionRefused(address.to_string());
        let listener = self
            .shared
            .listeners
            .get(address)
            .map(|l| l.value().clone())
            .ok_or_else(refused)?;

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server = MemoryConnection::new(address, server_tx, server_rx);
        listener.send(server).map_err(|_| refused())?;

        self.shared.dials.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection::new(address, client_tx, client_rx)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// MemoryListener
// ---------------------------------------------------------------------------

/// Accept side of a memory address. Dropping it frees the address.
#[derive(Debug)]
pub struct MemoryListener {
    address: String,
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
    shared: Arc<Shared>,
}

impl MemoryListener {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Waits for the next dialed connection.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.incoming.recv().await
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.incoming.close();
        self.shared
            .listeners
            .remove_if(&self.address, |_, tx| tx.is_closed());
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// One end of an in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    remote: String,
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryConnection {
    fn new(
        remote: &str,
        tx: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            remote: remote.to_string(),
            tx: Some(tx),
            rx,
        }
    }

    /// Returns `true` once this end has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame.clone()).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Frame, TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Closed);
        }
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.rx.close();
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
    async fn dial_without_listener_is_refused() {
        let transport = MemoryTransport::new();
        let err = transport
            .dial("nowhere", &DialOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, TransportError::ConnectionRefused("nowhere".into()));
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("svc").unwrap();
        let mut client = transport.dial("svc", &DialOptions::default()).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        let ping = Frame::new(HashMap::from([("k".into(), "v".into())]), b"ping".to_vec());
        client.send(&ping).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), ping);

        let pong = Frame::new(HashMap::new(), b"pong".to_vec());
        server.send(&pong).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), pong);
        assert_eq!(client.remote_address(), "svc");
    }

    #[tokio::test]
    async fn close_is_observed_by_peer() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("svc").unwrap();
        let mut client = transport.dial("svc", &DialOptions::default()).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(server.recv().await, Err(TransportError::Closed));
        assert_eq!(
            client.send(&Frame::default()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn address_is_reusable_after_listener_drop() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("svc").unwrap();
        assert!(matches!(
            transport.listen("svc"),
            Err(TransportError::AddressInUse(_))
        ));
        drop(listener);
        assert!(transport.listen("svc").is_ok());
    }
}
