//! Service registry contract consumed by the selector.

pub mod memory;

use async_trait::async_trait;
use stack_core::Service;
use tokio::sync::mpsc;

pub use memory::MemoryRegistry;

/// Errors a registry backend reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("service not found")]
    NotFound,
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Kind of change carried by a [`RegistryEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

/// One change notification. For `Create`/`Update` the service carries the
/// nodes that appeared or changed; for `Delete` the nodes that went away.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    pub action: EventAction,
    pub service: Service,
}

/// Lookup and change-watch over named services.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// All records (one per version) registered under `name`.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError>;

    /// Subscribes to change events. The stream ends when the registry goes
    /// away.
    async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, RegistryError>;

    fn name(&self) -> &'static str;
}
