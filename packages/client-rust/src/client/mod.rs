//! The RPC client: call orchestration, stream establishment and publishing
//! on top of a selector, a transport, a connection pool and an optional
//! broker.
//!
//! Configuration lives behind an [`ArcSwap`] so [`Client::reconfigure`]
//! never blocks in-flight calls; each call loads one snapshot and keeps it
//! for its whole lifetime.

mod call;
pub mod options;
mod publish;
mod streaming;


use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use arc_swap::ArcSwap;
use stack_core::{CallError, CodecRegistry, Payload, Publication, Request};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::config::ClientConfig;
use crate::middleware::CallWrapper;
use crate::pool::Pool;
use crate::selector::Selector;
use crate::transport::Transport;

pub use options::{BackoffFn, CallOptions, RetryFn};

/// Configuration snapshot shared by the calls started under it.
struct ClientState {
    config: ClientConfig,
    pool: Arc<Pool>,
    defaults: CallOptions,
}

/// RPC client. Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Client {
    selector: Arc<dyn Selector>,
    transport: Arc<dyn Transport>,
    broker: Option<Arc<dyn Broker>>,
    codecs: Arc<CodecRegistry>,
    state: ArcSwap<ClientState>,
    seq: Arc<AtomicU64>,
    broker_connected: OnceCell<()>,
}

impl Client {
    #[must_use]
    pub fn builder(selector: Arc<dyn Selector>, transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder {
            selector,
            transport,
            broker: None,
            codecs: CodecRegistry::default(),
            config: ClientConfig::default(),
            wrappers: Vec::new(),
            backoff: None,
            retry: None,
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> ClientConfig {
        self.state.load().config.clone()
    }

    /// Defaults every call starts from.
    #[must_use]
    pub fn options(&self) -> CallOptions {
        self.state.load().defaults.clone()
    }

    #[must_use]
    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.selector
    }

    /// Builds a request carrying the configured default content type.
    #[must_use]
    pub fn new_request(
        &self,
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl Into<Payload>,
    ) -> Request {
        Request::new(service, endpoint, body.into())
            .with_content_type(self.state.load().config.content_type.clone())
    }

    /// Builds a publication carrying the configured default content type.
    #[must_use]
    pub fn new_publication(&self, topic: impl Into<String>, payload: impl Into<Payload>) -> Publication {
        Publication::new(topic, payload.into())
            .with_content_type(self.state.load().config.content_type.clone())
    }

    /// Replaces the configuration. The connection pool is rebuilt only when
    /// its size or TTL changed. The replaced pool is retired: its idle
    /// connections are closed but calls already in flight keep dialing
    /// through it and finish on the snapshot they started with.
    pub async fn reconfigure(&self, config: ClientConfig) {
        let current = self.state.load_full();
        let rebuild = current.config.pool != config.pool;
        let pool = if rebuild {
            Arc::new(Pool::new(Arc::clone(&self.transport), config.pool))
        } else {
            Arc::clone(&current.pool)
        };
        let mut defaults = current.defaults.clone();
        defaults.apply_config(&config.call);

        self.state.store(Arc::new(ClientState {
            config,
            pool,
            defaults,
        }));
        info!(pool_rebuilt = rebuild, "client reconfigured");

        if rebuild {
            current.pool.retire().await;
            debug!("replaced pool retired");
        }
    }

    /// Closes the pool and the selector.
    ///
    /// # Errors
    ///
    /// Returns the first failure; both steps always run.
    pub async fn close(&self) -> Result<(), CallError> {
        let pool = self.state.load().pool.close().await;
        let selector = self.selector.close().await.map_err(CallError::from);
        pool.and(selector)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("Client")
            .field("selector", &self.selector.name())
            .field("transport", &self.transport.name())
            .field("broker", &self.broker.as_ref().map(|b| b.name()))
            .field("config", &state.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ClientBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Client`].
pub struct ClientBuilder {
    selector: Arc<dyn Selector>,
    transport: Arc<dyn Transport>,
    broker: Option<Arc<dyn Broker>>,
    codecs: CodecRegistry,
    config: ClientConfig,
    wrappers: Vec<CallWrapper>,
    backoff: Option<BackoffFn>,
    retry: Option<RetryFn>,
}

impl ClientBuilder {
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    #[must_use]
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a wrapper applied to every call.
    #[must_use]
    pub fn wrapper(mut self, wrapper: CallWrapper) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = Some(backoff);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryFn) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn build(self) -> Client {
        let mut defaults = CallOptions::from_config(&self.config.call);
        defaults.wrappers = self.wrappers;
        if let Some(backoff) = self.backoff {
            defaults.backoff = backoff;
        }
        if let Some(retry) = self.retry {
            defaults.retry = retry;
        }
        let pool = Arc::new(Pool::new(Arc::clone(&self.transport), self.config.pool));

        Client {
            selector: self.selector,
            transport: self.transport,
            broker: self.broker,
            codecs: Arc::new(self.codecs),
            state: ArcSwap::from_pointee(ClientState {
                config: self.config,
                pool,
                defaults,
            }),
            seq: Arc::new(AtomicU64::new(1)),
            broker_connected: OnceCell::new(),
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("selector", &self.selector.name())
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .field("wrappers", &self.wrappers)
            .finish_non_exhaustive()
    }
}
