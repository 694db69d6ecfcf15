//! Service discovery data model: `Node` and `Service`.
//!
//! Both types are owned by the registry and treated as immutable snapshots
//! once observed by the client. Field names serialize in camelCase so the
//! records can be exchanged with registries written in other languages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata key a node uses to declare the wire protocol it speaks.
pub const PROTOCOL_METADATA_KEY: &str = "protocol";

/// Protocol name advertised by nodes that speak the current framing.
pub const DEFAULT_PROTOCOL: &str = "stack";

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One addressable running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Registry-unique node identifier.
    pub id: String,
    /// `host:port` or a logical queue name understood by the transport.
    pub address: String,
    /// Free-form metadata (e.g. the declared wire protocol).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Creates a node with empty metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// Builder-style metadata insertion.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the protocol this node declares, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.metadata
            .get(PROTOCOL_METADATA_KEY)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A named, versioned group of nodes.
///
/// Several `Service` records with the same name and different versions may
/// coexist in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Creates a service record with no nodes.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Builder-style node insertion.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Merges `nodes` into this record: nodes with a known id are replaced in
    /// place, unknown ones are appended. Order of existing nodes is kept.
    pub fn merge_nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            match self.nodes.iter_mut().find(|n| n.id == node.id) {
                Some(existing) => *existing = node.clone(),
                None => self.nodes.push(node.clone()),
            }
        }
    }

    /// Removes every node whose id appears in `nodes`.
    pub fn remove_nodes(&mut self, nodes: &[Node]) {
        self.nodes.retain(|n| !nodes.iter().any(|gone| gone.id == n.id));
    }
}

/// Flattens the nodes of all given service records, preserving order.
#[must_use]
pub fn flatten_nodes(services: &[Service]) -> Vec<&Node> {
    services.iter().flat_map(|s| s.nodes.iter()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_ignores_empty_value() {
        let node = Node::new("a", "127.0.0.1:1").with_metadata(PROTOCOL_METADATA_KEY, "");
        assert_eq!(node.protocol(), None);

        let node = node.with_metadata(PROTOCOL_METADATA_KEY, "stack");
        assert_eq!(node.protocol(), Some("stack"));
    }

    #[test]
    fn merge_replaces_known_and_appends_new() {
        let mut svc = Service::new("foo", "1.0.0")
            .with_node(Node::new("a", "x:1"))
            .with_node(Node::new("b", "y:1"));

        svc.merge_nodes(&[Node::new("b", "y:2"), Node::new("c", "z:1")]);

        let addrs: Vec<_> = svc.nodes.iter().map(|n| n.address.as_str()).collect();
        assert_eq!(addrs, vec!["x:1", "y:2", "z:1"]);
    }

    #[test]
    fn remove_nodes_by_id() {
        let mut svc = Service::new("foo", "1.0.0")
            .with_node(Node::new("a", "x:1"))
            .with_node(Node::new("b", "y:1"));
        svc.remove_nodes(&[Node::new("a", "ignored")]);
        assert_eq!(svc.nodes.len(), 1);
        assert_eq!(svc.nodes[0].id, "b");
    }

    #[test]
    fn flatten_preserves_order_across_versions() {
        let services = vec![
            Service::new("foo", "1").with_node(Node::new("a", "x")),
            Service::new("foo", "2")
                .with_node(Node::new("b", "y"))
                .with_node(Node::new("c", "z")),
        ];
        let ids: Vec<_> = flatten_nodes(&services).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn service_json_uses_camel_case_and_defaults() {
        let svc: Service =
            serde_json::from_str(r#"{"name":"foo","version":"1.0.0"}"#).expect("decode");
        assert!(svc.nodes.is_empty());
        assert!(svc.metadata.is_empty());
    }
}
