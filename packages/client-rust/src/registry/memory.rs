//! In-process registry used by tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use stack_core::Service;
use tokio::sync::mpsc;

use super::{EventAction, Registry, RegistryError, RegistryEvent};

/// Registry backed by a map of service name to version records.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: RwLock<HashMap<String, Vec<Service>>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<RegistryEvent>>>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`. Nodes are merged into an existing record of the
    /// same version, otherwise a new version record is added.
    pub fn register(&self, service: &Service) {
        let action = {
            let mut services = self.services.write();
            let versions = services.entry(service.name.clone()).or_default();
            if let Some(existing) = versions.iter_mut().find(|s| s.version == service.version) {
                existing.merge_nodes(&service.nodes);
                existing.metadata.clone_from(&service.metadata);
                EventAction::Update
            } else {
                versions.push(service.clone());
                EventAction::Create
            }
        };
        self.notify(action, service);
    }

    /// Removes the nodes of `service` from its version record. Empty version
    /// records and names without versions are dropped.
    pub fn deregister(&self, service: &Service) {
        {
            let mut services = self.services.write();
            let Some(versions) = services.get_mut(&service.name) else {
                return;
            };
            for record in versions.iter_mut().filter(|s| s.version == service.version) {
                record.remove_nodes(&service.nodes);
            }
            versions.retain(|s| !s.nodes.is_empty());
            if versions.is_empty() {
                services.remove(&service.name);
            }
        }
        self.notify(EventAction::Delete, service);
    }

    fn notify(&self, action: EventAction, service: &Service) {
        let event = RegistryEvent {
            action,
            service: service.clone(),
        };
        self.watchers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        match self.services.read().get(name) {
            Some(versions) if !versions.is_empty() => Ok(versions.clone()),
            _ => Err(RegistryError::NotFound),
        }
    }

    async fn watch(&self) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use stack_core::Node;

    use super::*;

    fn svc(version: &str, nodes: &[(&str, &str)]) -> Service {
        nodes
            .iter()
            .fold(Service::new("foo", version), |s, (id, addr)| {
                s.with_node(Node::new(*id, *addr))
            })
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let registry = MemoryRegistry::new();
        assert_eq!(
            registry.get_service("nope").await,
            Err(RegistryError::NotFound)
        );
    }

    #[tokio::test]
    async fn register_merges_by_version() {
        let registry = MemoryRegistry::new();
        registry.register(&svc("1", &[("a", "x:1")]));
        registry.register(&svc("1", &[("b", "y:1")]));
        registry.register(&svc("2", &[("c", "z:1")]));

        let services = registry.get_service("foo").await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].nodes.len(), 2);
    }

    #[tokio::test]
    async fn deregister_last_node_removes_service() {
        let registry = MemoryRegistry::new();
        registry.register(&svc("1", &[("a", "x:1")]));
        registry.deregister(&svc("1", &[("a", "x:1")]));
        assert_eq!(
            registry.get_service("foo").await,
            Err(RegistryError::NotFound)
        );
    }

    #[tokio::test]
    async fn watchers_receive_events() {
        let registry = MemoryRegistry::new();
        let mut rx = registry.watch().await.unwrap();

        registry.register(&svc("1", &[("a", "x:1")]));
        registry.register(&svc("1", &[("b", "y:1")]));
        registry.deregister(&svc("1", &[("a", "x:1")]));

        assert_eq!(rx.recv().await.unwrap().action, EventAction::Create);
        assert_eq!(rx.recv().await.unwrap().action, EventAction::Update);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.action, EventAction::Delete);
        assert_eq!(deleted.service.nodes[0].id, "a");
    }

    #[tokio::test]
    async fn dropped_watchers_are_pruned() {
        let registry = MemoryRegistry::new();
        drop(registry.watch().await.unwrap());
        registry.register(&svc("1", &[("a", "x:1")]));
        assert!(registry.watchers.lock().is_empty());
    }
}
