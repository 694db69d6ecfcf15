//! Attempt pipeline composition.
//!
//! The metrics layer sits closest to the attempt itself so it times the
//! exchange only; caller wrappers go around it, the first registered one
//! outermost.

use tower::util::BoxCloneService;
use tower::Layer;

use super::{AttemptService, CallWrapper, MetricsLayer};

/// Wraps `base` with the metrics layer and then with `wrappers`.
#[must_use]
pub fn build_attempt_pipeline(base: AttemptService, wrappers: &[CallWrapper]) -> AttemptService {
    let instrumented = BoxCloneService::new(MetricsLayer.layer(base));
    wrappers
        .iter()
        .rev()
        .fold(instrumented, |svc, wrapper| wrapper.wrap(svc))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
