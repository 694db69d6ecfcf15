//! Stack client: node selection, connection pooling, framing and the
//! retrying call engine.

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod framer;
pub mod middleware;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod stream;
pub mod telemetry;
pub mod transport;

pub use client::{CallOptions, Client, ClientBuilder};
pub use config::{CallConfig, ClientConfig, PoolConfig, ProxyConfig};
pub use context::CallContext;
pub use middleware::{Attempt, CallWrapper, MetricsLayer};
pub use pool::{Pool, PooledConnection};
pub use selector::{BlacklistSelector, Next, RegistrySelector, SelectOptions, Selector};
pub use stream::Stream;
pub use telemetry::{init_tracing, LogFormat};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {}
}
