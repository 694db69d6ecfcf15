//! Keyed pool of idle transport connections.
//!
//! Each address owns a bounded buffer of idle connections. `get` hands out
//! the most recently released live connection for the address (removing it
//! from the buffer) or dials a new one; `release` puts an error-free
//! connection back while the buffer has room and closes it otherwise. A
//! connection is checked out by exactly one caller at a time.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stack_core::error::component;
use stack_core::{CallError, Frame};
use tokio::time::Instant;
use tracing::debug;

use crate::config::PoolConfig;
use crate::transport::{Connection, DialOptions, Transport, TransportError};

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A transport connection checked out of (or destined for) a [`Pool`].
pub struct PooledConnection {
    id: u64,
    address: String,
    conn: Box<dyn Connection>,
    created: Instant,
    last_used: Instant,
}

impl PooledConnection {
    /// Pool-unique identifier, stable across reuse.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// # Errors
    ///
    /// Returns the transport error if the frame could not be sent.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.conn.send(frame).await
    }

    /// # Errors
    ///
    /// Returns the transport error if no frame could be received.
    pub async fn recv(&mut self) -> Result<Frame, TransportError> {
        self.conn.recv().await
    }

    /// # Errors
    ///
    /// Returns the transport error raised while closing.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.conn.close().await
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("remote", &self.conn.remote_address())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Whether a pool still hands out and takes back connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// Replaced by a newer pool: checkouts still dial, releases close.
    Retired,
    Closed,
}

/// Idle buffers and lifecycle, guarded together.
struct Idle {
    lifecycle: Lifecycle,
    buffers: HashMap<String, Vec<PooledConnection>>,
}

/// Per-address idle buffers behind one lock.
pub struct Pool {
    transport: Arc<dyn Transport>,
    size: usize,
    ttl: Duration,
    idle: Mutex<Idle>,
    next_id: AtomicU64,
}

impl Pool {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self {
            transport,
            size: config.size,
            ttl: config.ttl,
            idle: Mutex::new(Idle {
                lifecycle: Lifecycle::Open,
                buffers: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            size: self.size,
            ttl: self.ttl,
        }
    }

    /// Number of idle connections held for `address`.
    #[must_use]
    pub fn idle_count(&self, address: &str) -> usize {
        self.idle.lock().buffers.get(address).map_or(0, Vec::len)
    }

    /// Checks out a live idle connection for `address`, or dials one.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Connection` if the pool is closed or the dial
    /// fails.
    pub async fn get(
        &self,
        address: &str,
        options: &DialOptions,
    ) -> Result<PooledConnection, CallError> {
        let (reused, mut expired) = self.take_idle(address)?;
        for conn in &mut expired {
            debug!(address, conn_id = conn.id, "closing expired pooled connection");
            let _ = conn.close().await;
        }
        if let Some(conn) = reused {
            return Ok(conn);
        }

        let conn = self
            .transport
            .dial(address, options)
            .await
            .map_err(|e| CallError::connection(component::POOL, e))?;
        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(address, conn_id = id, transport = self.transport.name(), "dialed connection");
        Ok(PooledConnection {
            id,
            address: address.to_string(),
            conn,
            created: now,
            last_used: now,
        })
    }

    /// Brings an already established connection (e.g. an accepted one)
    /// under pool management so it can be framed and released like a dialed
    /// one.
    #[must_use]
    pub fn adopt(&self, conn: Box<dyn Connection>) -> PooledConnection {
        let now = Instant::now();
        PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            address: conn.remote_address().to_string(),
            conn,
            created: now,
            last_used: now,
        }
    }

    #[allow(clippy::type_complexity)]
    fn take_idle(
        &self,
        address: &str,
    ) -> Result<(Option<PooledConnection>, Vec<PooledConnection>), CallError> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut idle = self.idle.lock();
        if idle.lifecycle == Lifecycle::Closed {
            return Err(CallError::connection(component::POOL, "pool closed"));
        }
        let Some(buffer) = idle.buffers.get_mut(address) else {
            return Ok((None, expired));
        };
        let mut reused = None;
        while let Some(conn) = buffer.pop() {
            if now.saturating_duration_since(conn.last_used) > self.ttl {
                expired.push(conn);
            } else {
                reused = Some(conn);
                break;
            }
        }
        if buffer.is_empty() {
            idle.buffers.remove(address);
        }
        Ok((reused, expired))
    }

    /// Returns a connection. It goes back to the idle buffer only when
    /// `error` is `None`, the pool is open and the buffer has room; in every
    /// other case it is closed.
    pub async fn release(&self, mut conn: PooledConnection, error: Option<&CallError>) {
        let rejected = {
            let mut idle = self.idle.lock();
            if error.is_some() || idle.lifecycle != Lifecycle::Open {
                Some(conn)
            } else {
                let buffer = idle
                    .buffers
                    .entry(conn.address.clone())
                    .or_insert_with(|| Vec::with_capacity(self.size.min(16)));
                if buffer.len() < self.size {
                    conn.last_used = Instant::now();
                    buffer.push(conn);
                    None
                } else {
                    Some(conn)
                }
            }
        };
        if let Some(mut conn) = rejected {
            debug!(
                address = %conn.address,
                conn_id = conn.id,
                error = error.map(tracing::field::display),
                "closing released connection"
            );
            let _ = conn.close().await;
        }
    }

    /// Closes the idle connections of a pool that has been replaced.
    /// Checkouts keep working so calls started on it can finish; every
    /// connection released afterwards is closed.
    pub async fn retire(&self) {
        for mut conn in self.drain(Lifecycle::Retired) {
            let _ = conn.close().await;
        }
    }

    /// Closes every idle connection and refuses further checkouts.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first transport error seen; every connection is still
    /// closed.
    pub async fn close(&self) -> Result<(), CallError> {
        let mut first_error = None;
        for mut conn in self.drain(Lifecycle::Closed) {
            if let Err(e) = conn.close().await {
                first_error.get_or_insert(CallError::connection(component::POOL, e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Moves the pool to `next` (never back out of `Closed`) and takes every
    /// idle connection.
    fn drain(&self, next: Lifecycle) -> Vec<PooledConnection> {
        let mut idle = self.idle.lock();
        if idle.lifecycle != Lifecycle::Closed {
            idle.lifecycle = next;
        }
        idle.buffers.drain().flat_map(|(_, conns)| conns).collect()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("transport", &self.transport.name())
            .field("size", &self.size)
            .field("ttl", &self.ttl)
            .field("lifecycle", &self.idle.lock().lifecycle)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryListener, MemoryTransport};

    fn pool_with(size: usize, ttl: Duration) -> (Pool, MemoryTransport, MemoryListener) {
        let transport = MemoryTransport::new();
        let listener = transport.listen("svc:1").unwrap();
        let pool = Pool::new(Arc::new(transport.clone()), PoolConfig { size, ttl });
        (pool, transport, listener)
    }

    fn failure() -> CallError {
        CallError::protocol(component::CODEC, "bad frame")
    }

    #[tokio::test]
    async fn released_connection_is_reused_without_dial() {
        let (pool, transport, _listener) = pool_with(2, Duration::from_secs(60));
        let opts = DialOptions::default();

        let conn = pool.get("svc:1", &opts).await.unwrap();
        let id = conn.id();
        pool.release(conn, None).await;
        assert_eq!(pool.idle_count("svc:1"), 1);

        let again = pool.get("svc:1", &opts).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(transport.dial_count(), 1);
        assert_eq!(pool.idle_count("svc:1"), 0);
    }

    #[tokio::test]
    async fn errored_connection_is_closed_never_reused() {
        let (pool, transport, mut listener) = pool_with(2, Duration::from_secs(60));
        let opts = DialOptions::default();

        let conn = pool.get("svc:1", &opts).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        pool.release(conn, Some(&failure())).await;
        assert_eq!(pool.idle_count("svc:1"), 0);
        assert_eq!(server.recv().await, Err(TransportError::Closed));

        let fresh = pool.get("svc:1", &opts).await.unwrap();
        assert_eq!(transport.dial_count(), 2);
        assert_ne!(fresh.id(), 0);
    }

    #[tokio::test]
    async fn release_beyond_size_closes() {
        let (pool, _transport, _listener) = pool_with(1, Duration::from_secs(60));
        let opts = DialOptions::default();

        let a = pool.get("svc:1", &opts).await.unwrap();
        let b = pool.get("svc:1", &opts).await.unwrap();
        pool.release(a, None).await;
        pool.release(b, None).await;
        assert_eq!(pool.idle_count("svc:1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_expire() {
        let (pool, transport, _listener) = pool_with(2, Duration::from_secs(5));
        let opts = DialOptions::default();

        let conn = pool.get("svc:1", &opts).await.unwrap();
        pool.release(conn, None).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        pool.get("svc:1", &opts).await.unwrap();
        assert_eq!(transport.dial_count(), 2);
        assert_eq!(pool.idle_count("svc:1"), 0);
    }

    #[tokio::test]
    async fn dial_failure_is_connection_error() {
        let pool = Pool::new(Arc::new(MemoryTransport::new()), PoolConfig::default());
        let err = pool.get("nowhere", &DialOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), stack_core::ErrorKind::Connection);
        assert_eq!(err.component(), Some(component::POOL));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_refuses_checkouts() {
        let (pool, _transport, _listener) = pool_with(2, Duration::from_secs(60));
        let opts = DialOptions::default();
        let conn = pool.get("svc:1", &opts).await.unwrap();
        pool.release(conn, None).await;

        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert_eq!(pool.idle_count("svc:1"), 0);
        assert!(pool.get("svc:1", &opts).await.is_err());
    }

    #[tokio::test]
    async fn release_after_close_closes_connection() {
        let (pool, _transport, mut listener) = pool_with(2, Duration::from_secs(60));
        let opts = DialOptions::default();
        let conn = pool.get("svc:1", &opts).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        pool.close().await.unwrap();
        pool.release(conn, None).await;
        assert_eq!(pool.idle_count("svc:1"), 0);
        assert_eq!(server.recv().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn retired_pool_still_dials_but_never_pools() {
        let (pool, transport, _listener) = pool_with(2, Duration::from_secs(60));
        let opts = DialOptions::default();
        let conn = pool.get("svc:1", &opts).await.unwrap();
        pool.release(conn, None).await;

        pool.retire().await;
        assert_eq!(pool.idle_count("svc:1"), 0);

        let conn = pool.get("svc:1", &opts).await.unwrap();
        assert_eq!(transport.dial_count(), 2);
        pool.release(conn, None).await;
        assert_eq!(pool.idle_count("svc:1"), 0);

        pool.close().await.unwrap();
        pool.retire().await;
        assert!(pool.get("svc:1", &opts).await.is_err());
    }
}
