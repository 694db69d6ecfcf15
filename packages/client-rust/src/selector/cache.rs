//! Caching selector backed by a [`Registry`].
//!
//! Lookups are cached per service name for `ttl`. An expired entry is always
//! refetched before use; a failed refetch is reported, never answered from
//! the stale entry. With `watch` enabled a background task applies registry
//! change events to cached entries between refreshes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use stack_core::{CallError, Node, Service};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{resolve, Next, SelectError, SelectOptions, Selector, SelectorOptions};
use crate::registry::{EventAction, Registry, RegistryError, RegistryEvent};

#[derive(Debug)]
struct CacheEntry {
    services: Vec<Service>,
    fetched: Instant,
}

#[derive(Debug)]
struct Shared {
    options: RwLock<SelectorOptions>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl Shared {
    fn apply(&self, event: &RegistryEvent) {
        let name = &event.service.name;
        let mut cache = self.cache.write();
        let Some(entry) = cache.get_mut(name) else {
            return;
        };
        let version = &event.service.version;
        match event.action {
            EventAction::Create | EventAction::Update => {
                match entry.services.iter_mut().find(|s| s.version == *version) {
                    Some(record) => record.merge_nodes(&event.service.nodes),
                    None => entry.services.push(event.service.clone()),
                }
            }
            EventAction::Delete => {
                for record in entry.services.iter_mut().filter(|s| s.version == *version) {
                    record.remove_nodes(&event.service.nodes);
                }
                entry.services.retain(|s| !s.nodes.is_empty());
            }
        }
        let emptied = entry.services.is_empty();
        if emptied {
            cache.remove(name);
        }
        debug!(service = %name, action = ?event.action, emptied, "selector cache updated from watch");
    }
}

#[derive(Debug)]
struct WatchHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

async fn run_watch(shared: Arc<Shared>, registry: Arc<dyn Registry>, token: CancellationToken) {
    let mut events = match registry.watch().await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(registry = registry.name(), error = %e, "registry watch failed to start");
            return;
        }
    };
    debug!(registry = registry.name(), "registry watch started");
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => shared.apply(&event),
                None => break,
            },
        }
    }
    debug!(registry = registry.name(), "registry watch stopped");
}

// ---------------------------------------------------------------------------
// RegistrySelector
// ---------------------------------------------------------------------------

/// Default selector: registry lookups with a TTL cache.
#[derive(Debug)]
pub struct RegistrySelector {
    shared: Arc<Shared>,
    watch: Mutex<Option<WatchHandle>>,
}

impl RegistrySelector {
    #[must_use]
    pub fn new(options: SelectorOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options: RwLock::new(options),
                cache: RwLock::new(HashMap::new()),
            }),
            watch: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_registry(registry: Arc<dyn Registry>) -> Self {
        Self::new(SelectorOptions::with_registry(registry))
    }

    /// Returns `true` if a fresh entry for `service` is cached.
    #[must_use]
    pub fn is_cached(&self, service: &str) -> bool {
        self.cached(service).is_some()
    }

    fn cached(&self, service: &str) -> Option<Vec<Service>> {
        let ttl = self.shared.options.read().ttl;
        let cache = self.shared.cache.read();
        cache
            .get(service)
            .filter(|entry| entry.fetched.elapsed() < ttl)
            .map(|entry| entry.services.clone())
    }

    async fn lookup(&self, service: &str) -> Result<Vec<Service>, SelectError> {
        if let Some(services) = self.cached(service) {
            return Ok(services);
        }
        let registry = self
            .shared
            .options
            .read()
            .registry
            .clone()
            .ok_or(SelectError::NotConfigured("no registry"))?;

        match registry.get_service(service).await {
            Ok(services) => {
                debug!(service, versions = services.len(), "selector cache refreshed");
                self.shared.cache.write().insert(
                    service.to_string(),
                    CacheEntry {
                        services: services.clone(),
                        fetched: Instant::now(),
                    },
                );
                Ok(services)
            }
            Err(RegistryError::NotFound) => {
                self.reset(service);
                Err(SelectError::NotFound {
                    service: service.to_string(),
                })
            }
            Err(e) => {
                self.reset(service);
                Err(SelectError::Registry(e.to_string()))
            }
        }
    }

    fn ensure_watch(&self) {
        let (enabled, registry) = {
            let options = self.shared.options.read();
            (options.watch, options.registry.clone())
        };
        let Some(registry) = registry.filter(|_| enabled) else {
            return;
        };
        let mut watch = self.watch.lock();
        if watch.as_ref().is_some_and(|w| !w.task.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        let task = tokio::spawn(run_watch(
            Arc::clone(&self.shared),
            registry,
            token.clone(),
        ));
        *watch = Some(WatchHandle { token, task });
    }

    async fn stop_watch(&self) {
        let handle = self.watch.lock().take();
        if let Some(WatchHandle { token, task }) = handle {
            token.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "registry watch task failed");
            }
        }
    }
}

#[async_trait]
impl Selector for RegistrySelector {
    async fn init(&self, options: SelectorOptions) -> Result<(), SelectError> {
        if options.registry.is_none() {
            return Err(SelectError::NotConfigured("no registry"));
        }
        self.stop_watch().await;
        *self.shared.options.write() = options;
        self.shared.cache.write().clear();
        Ok(())
    }

    fn options(&self) -> SelectorOptions {
        self.shared.options.read().clone()
    }

    async fn select(&self, service: &str, options: &SelectOptions) -> Result<Next, SelectError> {
        self.ensure_watch();
        let services = self.lookup(service).await?;
        let strategy = Arc::clone(&self.shared.options.read().strategy);
        resolve(service, services, options, &strategy)
    }

    fn mark(&self, _service: &str, _node: &Node, _error: Option<&CallError>) {}

    fn reset(&self, service: &str) {
        if self.shared.cache.write().remove(service).is_some() {
            debug!(service, "selector cache entry dropped");
        }
    }

    async fn close(&self) -> Result<(), SelectError> {
        self.stop_watch().await;
        self.shared.cache.write().clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}

impl Drop for RegistrySelector {
    fn drop(&mut self) {
        if let Some(handle) = self.watch.get_mut().take() {
            handle.token.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::selector::{filter, strategy::RoundRobin};

    /// Counts lookups reaching the wrapped registry.
    #[derive(Debug, Default)]
    struct CountingRegistry {
        inner: MemoryRegistry,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Registry for CountingRegistry {
        async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_service(name).await
        }

        async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, RegistryError> {
            self.inner.watch().await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn foo(nodes: &[(&str, &str)]) -> Service {
        nodes.iter().fold(Service::new("foo", "1.0"), |s, (id, addr)| {
            s.with_node(Node::new(*id, *addr))
        })
    }

    fn selector_with(registry: &Arc<CountingRegistry>, watch: bool) -> RegistrySelector {
        let registry: Arc<dyn Registry> = Arc::clone(registry) as Arc<dyn Registry>;
        RegistrySelector::new(SelectorOptions {
            registry: Some(registry),
            strategy: Arc::new(RoundRobin::new()),
            ttl: Duration::from_secs(10),
            watch,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_from_fresh_start_returns_x_y_x() {
        let registry = Arc::new(CountingRegistry::default());
        registry.inner.register(&foo(&[("A", "X"), ("B", "Y")]));
        let selector = selector_with(&registry, false);

        let mut picked = Vec::new();
        for _ in 0..3 {
            let next = selector.select("foo", &SelectOptions::default()).await.unwrap();
            picked.push(next.next().unwrap().address);
        }
        assert_eq!(picked, vec!["X", "Y", "X"]);
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_refetched() {
        let registry = Arc::new(CountingRegistry::default());
        registry.inner.register(&foo(&[("A", "X")]));
        let selector = selector_with(&registry, false);

        selector.select("foo", &SelectOptions::default()).await.unwrap();
        assert!(selector.is_cached("foo"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!selector.is_cached("foo"));

        selector.select("foo", &SelectOptions::default()).await.unwrap();
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_not_served_after_service_vanishes() {
        let registry = Arc::new(CountingRegistry::default());
        registry.inner.register(&foo(&[("A", "X")]));
        let selector = selector_with(&registry, false);
        selector.select("foo", &SelectOptions::default()).await.unwrap();

        registry.inner.deregister(&foo(&[("A", "X")]));
        tokio::time::advance(Duration::from_secs(11)).await;

        let err = selector.select("foo", &SelectOptions::default()).await.err();
        assert_eq!(err, Some(SelectError::NotFound { service: "foo".into() }));
        assert!(!selector.is_cached("foo"));
    }

    #[tokio::test]
    async fn unknown_service_and_filtered_service() {
        let registry = Arc::new(CountingRegistry::default());
        registry.inner.register(&foo(&[("A", "X")]));
        let selector = selector_with(&registry, false);

        assert!(matches!(
            selector.select("bar", &SelectOptions::default()).await,
            Err(SelectError::NotFound { .. })
        ));
        let options = SelectOptions::default().with_filter(filter::version("9.9"));
        assert!(matches!(
            selector.select("foo", &options).await,
            Err(SelectError::NoneAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn reset_forces_registry_query() {
        let registry = Arc::new(CountingRegistry::default());
        registry.inner.register(&foo(&[("A", "X")]));
        let selector = selector_with(&registry, false);

        selector.select("foo", &SelectOptions::default()).await.unwrap();
        selector.reset("foo");
        selector.select("foo", &SelectOptions::default()).await.unwrap();
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn init_without_registry_is_rejected() {
        let selector = RegistrySelector::new(SelectorOptions::default());
        assert_eq!(
            selector.init(SelectorOptions::default()).await,
            Err(SelectError::NotConfigured("no registry"))
        );
        assert!(matches!(
            selector.select("foo", &SelectOptions::default()).await,
            Err(SelectError::NotConfigured(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_applies_changes_to_cached_entries() {
        let registry = Arc::new(CountingRegistry::default());
        registry.inner.register(&foo(&[("A", "X"), ("B", "Y")]));
        let selector = selector_with(&registry, true);

        selector.select("foo", &SelectOptions::default()).await.unwrap();
        // Let the watch task subscribe.
        tokio::time::sleep(Duration::from_millis(1)).await;

        registry.inner.deregister(&foo(&[("B", "Y")]));
        registry.inner.register(&foo(&[("C", "Z")]));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let next = selector.select("foo", &SelectOptions::default()).await.unwrap();
        let mut ids: Vec<_> = next.services()[0].nodes.iter().map(|n| n.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "C"]);
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);

        selector.close().await.unwrap();
        assert!(!selector.is_cached("foo"));
    }
}
