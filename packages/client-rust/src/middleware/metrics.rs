//! Metrics middleware for call attempts.
//!
//! Records every attempt in a `tracing` span and in the
//! `stack_client_attempts_total` counter and
//! `stack_client_attempt_duration_seconds` histogram.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use stack_core::{CallError, Payload};
use tower::{Layer, Service};
use tracing::{debug_span, Instrument};

use super::Attempt;

/// Counter of finished attempts, labelled by service and outcome.
pub const ATTEMPTS_TOTAL: &str = "stack_client_attempts_total";
/// Histogram of attempt durations in seconds, labelled by service.
pub const ATTEMPT_DURATION_SECONDS: &str = "stack_client_attempt_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments attempts with timing and counting.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper recording attempt duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome(result: &Result<Payload, CallError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) if err.is_deadline() => "deadline",
        Err(CallError::Remote(_)) => "remote_error",
        Err(_) => "error",
    }
}

impl<S> Service<Attempt> for MetricsService<S>
where
    S: Service<Attempt, Response = Payload, Error = CallError> + Send,
    S::Future: Send + 'static,
{
    type Response = Payload;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Payload, CallError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, attempt: Attempt) -> Self::Future {
        let service = attempt.request.service().to_string();
        let span = debug_span!(
            "attempt",
            service = %service,
            endpoint = attempt.request.endpoint(),
            node = %attempt.node.address,
            number = attempt.number,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(attempt);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome(&result);

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(ATTEMPTS_TOTAL, "service" => service.clone(), "outcome" => outcome)
                    .increment(1);
                metrics::histogram!(ATTEMPT_DURATION_SECONDS, "service" => service)
                    .record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use stack_core::error::component;
    use stack_core::{Node, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::context::CallContext;

    fn attempt() -> Attempt {
        Attempt {
            ctx: CallContext::new(),
            node: Node::new("n", "x:1"),
            request: Arc::new(Request::new("foo", "Foo.Bar", Payload::empty())),
            number: 0,
            request_timeout: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(tower::service_fn(|a: Attempt| async move {
            Ok::<_, CallError>(Payload::from(json!({"node": a.node.address})))
        }));
        let resp = svc.oneshot(attempt()).await.unwrap();
        assert_eq!(resp, Payload::from(json!({"node": "x:1"})));
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_error() {
        let svc = MetricsLayer.layer(tower::service_fn(|_: Attempt| async {
            Err::<Payload, _>(CallError::connection(component::POOL, "refused"))
        }));
        let err = svc.oneshot(attempt()).await.unwrap_err();
        assert_eq!(err.component(), Some(component::POOL));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome(&Ok(Payload::empty())), "ok");
        assert_eq!(
            outcome(&Err(CallError::timeout(component::CLIENT, "x"))),
            "deadline"
        );
        assert_eq!(outcome(&Err(CallError::remote("boom"))), "remote_error");
    }
}
