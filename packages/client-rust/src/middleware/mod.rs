//! Call wrappers: tower middleware around a single call attempt.
//!
//! One attempt is a [`tower::Service`] taking an [`Attempt`] (the node
//! already chosen) and producing the response payload. Wrappers decorate
//! that service; the orchestrator composes them per call with
//! [`pipeline::build_attempt_pipeline`].

pub mod metrics;
pub mod pipeline;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stack_core::{CallError, Node, Payload, Request};
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::context::CallContext;

pub use metrics::MetricsLayer;

/// Input of one attempt against one node.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Cancellation scope of this attempt only.
    pub ctx: CallContext,
    pub node: Node,
    pub request: Arc<Request>,
    /// Zero-based attempt number within the call.
    pub number: u32,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
}

/// Type-erased attempt service.
pub type AttemptService = BoxCloneService<Attempt, Payload, CallError>;

/// Decorates an [`AttemptService`]. Wrappers registered first end up
/// outermost.
#[derive(Clone)]
pub struct CallWrapper {
    name: &'static str,
    wrap: Arc<dyn Fn(AttemptService) -> AttemptService + Send + Sync>,
}

impl CallWrapper {
    /// Wrapper from a plain function over the boxed service.
    pub fn from_fn(
        name: &'static str,
        wrap: impl Fn(AttemptService) -> AttemptService + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            wrap: Arc::new(wrap),
        }
    }

    /// Wrapper from any tower layer over attempt services.
    pub fn layer<L>(name: &'static str, layer: L) -> Self
    where
        L: Layer<AttemptService> + Send + Sync + 'static,
        L::Service: Service<Attempt, Response = Payload, Error = CallError> + Clone + Send + 'static,
        <L::Service as Service<Attempt>>::Future: Send + 'static,
    {
        Self::from_fn(name, move |inner| BoxCloneService::new(layer.layer(inner)))
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn wrap(&self, inner: AttemptService) -> AttemptService {
        (self.wrap)(inner)
    }
}

impl fmt::Debug for CallWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallWrapper").field(&self.name).finish()
    }
}
