//! Built-in candidate filters.

use std::sync::Arc;

use stack_core::Service;

/// Narrows a list of service records. Filters run after the lookup and
/// before the strategy.
pub type Filter = Arc<dyn Fn(Vec<Service>) -> Vec<Service> + Send + Sync>;

/// Keeps only records of the given version.
#[must_use]
pub fn version(version: impl Into<String>) -> Filter {
    let version = version.into();
    Arc::new(move |services| {
        services
            .into_iter()
            .filter(|s| s.version == version)
            .collect()
    })
}

/// Keeps only nodes whose metadata has `key` set to `value`.
#[must_use]
pub fn label(key: impl Into<String>, value: impl Into<String>) -> Filter {
    let key = key.into();
    let value = value.into();
    Arc::new(move |services| {
        services
            .into_iter()
            .map(|mut s| {
                s.nodes
                    .retain(|n| n.metadata.get(&key).is_some_and(|v| *v == value));
                s
            })
            .filter(|s| !s.nodes.is_empty())
            .collect()
    })
}
