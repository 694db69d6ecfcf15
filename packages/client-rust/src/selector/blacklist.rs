//! Selector decorator that sidelines repeatedly failing nodes.
//!
//! After `threshold` consecutive failed attempts a node is blacklisted for
//! `cooldown`; during that window it is filtered out of selections unless
//! it is the only candidate left. A success resets the node's record.
//! Deadline errors are the caller giving up and are not counted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use stack_core::{CallError, Node};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Next, SelectError, SelectOptions, Selector, SelectorOptions};

/// Default number of consecutive failures before a node is sidelined.
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Default time a sidelined node stays out of rotation.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy)]
struct NodeHealth {
    failures: u32,
    blacklisted_until: Option<Instant>,
}

impl NodeHealth {
    fn is_blacklisted(&self, now: Instant) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }
}

/// Wraps any selector with failure bookkeeping driven by `mark`.
pub struct BlacklistSelector {
    inner: Arc<dyn Selector>,
    threshold: u32,
    cooldown: Duration,
    health: DashMap<(String, String), NodeHealth>,
}

impl BlacklistSelector {
    #[must_use]
    pub fn new(inner: Arc<dyn Selector>) -> Self {
        Self::with_policy(inner, DEFAULT_THRESHOLD, DEFAULT_COOLDOWN)
    }

    #[must_use]
    pub fn with_policy(inner: Arc<dyn Selector>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner,
            threshold: threshold.max(1),
            cooldown,
            health: DashMap::new(),
        }
    }

    /// Returns `true` if `node` of `service` is currently sidelined.
    #[must_use]
    pub fn is_blacklisted(&self, service: &str, node: &Node) -> bool {
        let now = Instant::now();
        self.health
            .get(&(service.to_string(), node.id.clone()))
            .is_some_and(|h| h.is_blacklisted(now))
    }
}

impl std::fmt::Debug for BlacklistSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistSelector")
            .field("inner", &self.inner.name())
            .field("threshold", &self.threshold)
            .field("cooldown", &self.cooldown)
            .field("tracked", &self.health.len())
            .finish()
    }
}

#[async_trait]
impl Selector for BlacklistSelector {
    async fn init(&self, options: SelectorOptions) -> Result<(), SelectError> {
        self.health.clear();
        self.inner.init(options).await
    }

    fn options(&self) -> SelectorOptions {
        self.inner.options()
    }

    async fn select(&self, service: &str, options: &SelectOptions) -> Result<Next, SelectError> {
        let next = self.inner.select(service, options).await?;
        let now = Instant::now();
        let healthy = next.retain_nodes(|svc, node| {
            !self
                .health
                .get(&(svc.name.clone(), node.id.clone()))
                .is_some_and(|h| h.is_blacklisted(now))
        });
        Ok(healthy.unwrap_or(next))
    }

    fn mark(&self, service: &str, node: &Node, error: Option<&CallError>) {
        self.inner.mark(service, node, error);
        let key = (service.to_string(), node.id.clone());
        match error {
            None => {
                if self.health.remove(&key).is_some() {
                    debug!(service, node = %node.id, "node recovered");
                }
            }
            Some(err) if err.is_deadline() => {}
            Some(err) => {
                let mut health = self.health.entry(key).or_default();
                health.failures += 1;
                if health.failures >= self.threshold {
                    health.failures = 0;
                    health.blacklisted_until = Some(Instant::now() + self.cooldown);
                    warn!(
                        service,
                        node = %node.id,
                        address = %node.address,
                        cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "node blacklisted"
                    );
                }
            }
        }
    }

    fn reset(&self, service: &str) {
        self.health.retain(|(svc, _), _| svc != service);
        self.inner.reset(service);
    }

    async fn close(&self) -> Result<(), SelectError> {
        self.health.clear();
        self.inner.close().await
    }

    fn name(&self) -> &'static str {
        "blacklist"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
