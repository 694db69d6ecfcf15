//! Raw transport contract: dial an address and exchange whole frames.

pub mod memory;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use stack_core::Frame;

pub use memory::{MemoryConnection, MemoryListener, MemoryTransport};
pub use tcp::{TcpConnection, TcpListener, TcpTransport};

/// Default time allowed for establishing a connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors a transport reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("address already in use: {0}")]
    AddressInUse(String),
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
    #[error("frame codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Options applied when dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialOptions {
    pub timeout: Duration,
    /// The connection carries a long-lived stream.
    pub stream: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            stream: false,
        }
    }
}

/// One established duplex connection. Owned by a single caller at a time.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Result<Frame, TransportError>;

    /// Closes the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn remote_address(&self) -> &str;
}

/// Dialer for one kind of connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(
        &self,
        address: &str,
        options: &DialOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;

    fn name(&self) -> &'static str;
}
