//! Fire-and-forget publish contract used by the publish path.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

pub use memory::MemoryBroker;

/// Errors a broker reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A published message: header map plus encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerMessage {
    pub header: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Message broker backend.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError>;

    fn name(&self) -> &'static str;
}
