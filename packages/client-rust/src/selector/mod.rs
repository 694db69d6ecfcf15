//! Node selection: turns a service name into a source of candidate nodes.
//!
//! A [`Selector`] resolves a service through the registry (with caching),
//! narrows the records with caller filters and returns a [`Next`] source.
//! Every call to [`Next::next`] re-applies the strategy to the same lookup
//! result, so retries of one call may land on different nodes.

pub mod blacklist;
pub mod cache;
pub mod filter;
pub mod strategy;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stack_core::error::component;
use stack_core::types::{flatten_nodes, DEFAULT_PROTOCOL, PROTOCOL_METADATA_KEY};
use stack_core::{CallError, Node, Service};

use crate::registry::Registry;

pub use blacklist::BlacklistSelector;
pub use cache::RegistrySelector;
pub use filter::Filter;
pub use strategy::{RoundRobin, Strategy};

/// Default lifetime of a cached lookup.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Errors raised by selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("service {service}: not found")]
    NotFound { service: String },
    #[error("service {service}: none available")]
    NoneAvailable { service: String },
    #[error("registry error: {0}")]
    Registry(String),
    #[error("selector not configured: {0}")]
    NotConfigured(&'static str),
}

impl From<SelectError> for CallError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NotFound { service } => CallError::NotFound {
                component: component::SELECTOR,
                service,
            },
            SelectError::NoneAvailable { service } => CallError::NoneAvailable {
                component: component::SELECTOR,
                service,
            },
            other => CallError::internal(component::SELECTOR, other),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Construction-time selector options.
#[derive(Clone)]
pub struct SelectorOptions {
    pub registry: Option<Arc<dyn Registry>>,
    pub strategy: Arc<dyn Strategy>,
    /// How long a cached lookup may be served.
    pub ttl: Duration,
    /// Keep the cache warm with a background registry watch.
    pub watch: bool,
}

impl SelectorOptions {
    #[must_use]
    pub fn with_registry(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            registry: None,
            strategy: Arc::new(strategy::Random),
            ttl: DEFAULT_CACHE_TTL,
            watch: false,
        }
    }
}

impl fmt::Debug for SelectorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorOptions")
            .field("registry", &self.registry.as_ref().map(|r| r.name()))
            .field("strategy", &self.strategy.name())
            .field("ttl", &self.ttl)
            .field("watch", &self.watch)
            .finish()
    }
}

/// Per-call selection options.
#[derive(Clone, Default)]
pub struct SelectOptions {
    /// Applied in order to the looked-up records.
    pub filters: Vec<Filter>,
    /// Replaces the selector's strategy for this call.
    pub strategy: Option<Arc<dyn Strategy>>,
}

impl SelectOptions {
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Runs every filter over `services`.
    #[must_use]
    pub fn apply(&self, services: Vec<Service>) -> Vec<Service> {
        self.filters.iter().fold(services, |acc, f| f(acc))
    }
}

impl fmt::Debug for SelectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectOptions")
            .field("filters", &self.filters.len())
            .field("strategy", &self.strategy.as_ref().map(|s| s.name()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Candidate source for one call.
#[derive(Clone, Debug)]
pub struct Next {
    services: Arc<Vec<Service>>,
    strategy: Arc<dyn Strategy>,
}

impl Next {
    #[must_use]
    pub fn new(services: Vec<Service>, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            services: Arc::new(services),
            strategy,
        }
    }

    /// A fixed rotation over explicit addresses, bypassing discovery. The
    /// nodes declare the current protocol so no legacy remap applies.
    #[must_use]
    pub fn from_addresses(service: &str, addresses: &[String]) -> Self {
        let record = addresses.iter().fold(Service::new(service, ""), |s, addr| {
            s.with_node(Node::new(addr.clone(), addr.clone()).with_metadata(
                PROTOCOL_METADATA_KEY,
                DEFAULT_PROTOCOL,
            ))
        });
        Self::new(vec![record], Arc::new(RoundRobin::new()))
    }

    /// Draws the next candidate.
    ///
    /// # Errors
    ///
    /// Returns `SelectError::NoneAvailable` if the candidate set is empty.
    pub fn next(&self) -> Result<Node, SelectError> {
        self.strategy.choose(&self.services)
    }

    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Keeps only nodes accepted by `keep`. Returns `None` when no node would
    /// remain.
    #[must_use]
    pub fn retain_nodes(&self, keep: impl Fn(&Service, &Node) -> bool) -> Option<Self> {
        let services: Vec<Service> = self
            .services
            .iter()
            .map(|s| {
                let mut s = s.clone();
                let nodes = std::mem::take(&mut s.nodes);
                s.nodes = nodes.into_iter().filter(|n| keep(&s, n)).collect();
                s
            })
            .filter(|s| !s.nodes.is_empty())
            .collect();
        if services.is_empty() {
            None
        } else {
            Some(Self::new(services, Arc::clone(&self.strategy)))
        }
    }
}

/// Builds a [`Next`] from looked-up records, applying filters and the
/// strategy override.
///
/// # Errors
///
/// Returns `SelectError::NoneAvailable` if the filters leave no node.
pub fn resolve(
    service: &str,
    services: Vec<Service>,
    options: &SelectOptions,
    default_strategy: &Arc<dyn Strategy>,
) -> Result<Next, SelectError> {
    let services = options.apply(services);
    if flatten_nodes(&services).is_empty() {
        return Err(SelectError::NoneAvailable {
            service: service.to_string(),
        });
    }
    let strategy = options
        .strategy
        .clone()
        .unwrap_or_else(|| Arc::clone(default_strategy));
    Ok(Next::new(services, strategy))
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Turns a service name into candidate nodes and receives attempt feedback.
#[async_trait]
pub trait Selector: Send + Sync + 'static {
    /// Reattaches registry and strategy and drops cached state.
    ///
    /// # Errors
    ///
    /// Returns `SelectError::NotConfigured` if the options are unusable.
    async fn init(&self, options: SelectorOptions) -> Result<(), SelectError>;

    fn options(&self) -> SelectorOptions;

    /// # Errors
    ///
    /// `NotFound` for unknown services, `NoneAvailable` when filtering left
    /// nothing, `Registry` when the lookup itself failed.
    async fn select(&self, service: &str, options: &SelectOptions) -> Result<Next, SelectError>;

    /// Reports the outcome of one attempt against `node`. `None` means the
    /// attempt succeeded.
    fn mark(&self, service: &str, node: &Node, error: Option<&CallError>);

    /// Forgets any cached lookup of `service`.
    fn reset(&self, service: &str);

    /// # Errors
    ///
    /// Returns an error if background resources could not be released.
    async fn close(&self) -> Result<(), SelectError>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use stack_core::ErrorKind;

    use super::*;

    #[test]
    fn select_errors_convert_with_selector_component() {
        let err: CallError = SelectError::NotFound {
            service: "foo".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.component(), Some(component::SELECTOR));

        let err: CallError = SelectError::Registry("down".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn address_rotation_declares_protocol() {
        let next = Next::from_addresses("foo", &["a:1".to_string(), "b:1".to_string()]);
        let picked: Vec<_> = (0..3).map(|_| next.next().unwrap().address).collect();
        assert_eq!(picked, vec!["a:1", "b:1", "a:1"]);
        assert_eq!(next.next().unwrap().protocol(), Some(DEFAULT_PROTOCOL));
    }

    #[test]
    fn retain_nodes_drops_empty_records() {
        let next = Next::new(
            vec![
                Service::new("foo", "1").with_node(Node::new("a", "x")),
                Service::new("foo", "2").with_node(Node::new("b", "y")),
            ],
            Arc::new(RoundRobin::new()),
        );
        let only_b = next.retain_nodes(|_, n| n.id == "b").unwrap();
        assert_eq!(only_b.services().len(), 1);
        assert_eq!(only_b.next().unwrap().id, "b");
        assert!(next.retain_nodes(|_, _| false).is_none());
    }

    #[test]
    fn resolve_reports_none_available_after_filtering() {
        let services = vec![Service::new("foo", "1").with_node(Node::new("a", "x"))];
        let options = SelectOptions::default().with_filter(filter::version("2"));
        let default: Arc<dyn Strategy> = Arc::new(strategy::Random);
        assert_eq!(
            resolve("foo", services, &options, &default).err(),
            Some(SelectError::NoneAvailable {
                service: "foo".into()
            })
        );
    }
}
