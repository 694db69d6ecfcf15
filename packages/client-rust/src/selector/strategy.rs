//! Node-choice strategies.
//!
//! A strategy flattens every node of the supplied service records (order
//! preserved) and picks one. It never invents a node: the result is always
//! an element of the input.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use stack_core::types::flatten_nodes;
use stack_core::{Node, Service};

use super::SelectError;

/// Picks one node out of a set of service records.
pub trait Strategy: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns `SelectError::NoneAvailable` when the records hold no nodes.
    fn choose(&self, services: &[Service]) -> Result<Node, SelectError>;

    fn name(&self) -> &'static str;
}

fn none_available(services: &[Service]) -> SelectError {
    SelectError::NoneAvailable {
        service: services.first().map(|s| s.name.clone()).unwrap_or_default(),
    }
}

/// Looks up a built-in strategy by name.
#[must_use]
pub fn by_name(name: &str) -> Option<Arc<dyn Strategy>> {
    match name {
        "random" => Some(Arc::new(Random)),
        "roundrobin" | "round_robin" => Some(Arc::new(RoundRobin::new())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

/// Uniform pick, independent of history.
#[derive(Debug, Clone, Copy, Default)]
pub struct Random;

impl Strategy for Random {
    fn choose(&self, services: &[Service]) -> Result<Node, SelectError> {
        let nodes = flatten_nodes(services);
        if nodes.is_empty() {
            return Err(none_available(services));
        }
        let idx = rand::rng().random_range(0..nodes.len());
        Ok(nodes[idx].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// RoundRobin
// ---------------------------------------------------------------------------

/// Rotates through the nodes with a counter shared by every invocation.
///
/// With a stable node set, `n` consecutive picks visit each of the `n` nodes
/// exactly once, starting from the first node.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: Mutex<usize>,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn choose(&self, services: &[Service]) -> Result<Node, SelectError> {
        let nodes = flatten_nodes(services);
        if nodes.is_empty() {
            return Err(none_available(services));
        }
        let idx = {
            let mut counter = self.counter.lock();
            let idx = *counter % nodes.len();
            *counter = counter.wrapping_add(1);
            idx
        };
        Ok(nodes[idx].clone())
    }

    fn name(&self) -> &'static str {
        "roundrobin"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
