//! Unary call orchestration.
//!
//! A call resolves its candidate nodes once, fixes its deadline, then runs
//! attempts strictly one after another. Each attempt is its own task under
//! a child cancellation scope; the orchestrator races it against the call
//! context and cancels the scope as soon as it stops waiting.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use stack_core::error::component;
use stack_core::{CallError, CodecRegistry, Payload, Request};
use tokio::task::JoinError;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};
use tracing::{debug, debug_span, warn, Instrument};

use super::options::{BackoffFn, CallOptions};
use super::{Client, ClientState};
use crate::context::CallContext;
use crate::framer::Framer;
use crate::middleware::pipeline::build_attempt_pipeline;
use crate::middleware::Attempt;
use crate::pool::Pool;
use crate::selector::Next;
use crate::stream::{Release, Stream};
use crate::transport::DialOptions;

/// Where a call goes.
pub(super) struct Target {
    /// Name the candidates were resolved for.
    pub(super) service: String,
    pub(super) next: Next,
    /// A proxy is configured; retries are off.
    pub(super) proxied: bool,
}

impl Client {
    /// Performs a request/response call with the client defaults.
    ///
    /// # Errors
    ///
    /// `NotFound`/`NoneAvailable` if no node could be selected,
    /// `Connection`/`Protocol` for local failures, `Remote` for the callee's
    /// error and `Timeout`/`Cancelled` when the context ended first.
    pub async fn call(&self, ctx: &CallContext, request: Request) -> Result<Payload, CallError> {
        self.call_with(ctx, request, |_| {}).await
    }

    /// Like [`Client::call`], with `configure` adjusting a copy of the
    /// defaults for this call only.
    ///
    /// # Errors
    ///
    /// See [`Client::call`].
    pub async fn call_with(
        &self,
        ctx: &CallContext,
        request: Request,
        configure: impl FnOnce(&mut CallOptions),
    ) -> Result<Payload, CallError> {
        let span = debug_span!(
            "call",
            service = request.service(),
            endpoint = request.endpoint()
        );
        let state = self.state.load_full();
        let mut options = state.defaults.clone();
        configure(&mut options);
        self.run_call(ctx, request, options, &state)
            .instrument(span)
            .await
    }

    async fn run_call(
        &self,
        ctx: &CallContext,
        request: Request,
        mut options: CallOptions,
        state: &ClientState,
    ) -> Result<Payload, CallError> {
        let target = self.resolve(state, &request, &options).await?;

        let ctx = match ctx.remaining() {
            Some(remaining) => {
                options.request_timeout = remaining;
                ctx.clone()
            }
            None => ctx.clone().with_timeout(options.request_timeout),
        };
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let exchange = Exchange {
            pool: Arc::clone(&state.pool),
            codecs: Arc::clone(&self.codecs),
            seq: Arc::clone(&self.seq),
        };
        let svc = build_attempt_pipeline(BoxCloneService::new(exchange), &options.wrappers);
        let retries = if target.proxied { 0 } else { options.retries };
        let request = Arc::new(request);

        let attempt = {
            let next = target.next.clone();
            let service = target.service.clone();
            let selector = Arc::clone(&self.selector);
            let backoff = Arc::clone(&options.backoff);
            let request = Arc::clone(&request);
            let (request_timeout, dial_timeout) = (options.request_timeout, options.dial_timeout);
            move |scope: CallContext, number: u32| {
                let svc = svc.clone();
                let next = next.clone();
                let service = service.clone();
                let selector = Arc::clone(&selector);
                let backoff = Arc::clone(&backoff);
                let request = Arc::clone(&request);
                async move {
                    wait_backoff(&scope, &request, number, &backoff).await?;
                    let node = next.next()?;
                    let result = svc
                        .oneshot(Attempt {
                            ctx: scope,
                            node: node.clone(),
                            request,
                            number,
                            request_timeout,
                            dial_timeout,
                        })
                        .await;
                    selector.mark(&service, &node, result.as_ref().err());
                    result
                }
            }
        };

        run_attempts(&ctx, &request, &options, retries, attempt).await
    }

    /// Resolves the proxy settings, address override or selector into a
    /// candidate source.
    pub(super) async fn resolve(
        &self,
        state: &ClientState,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Target, CallError> {
        let proxy = state.config.proxy.as_ref().filter(|p| p.is_active());
        let service = proxy
            .and_then(|p| p.service.clone())
            .unwrap_or_else(|| request.service().to_string());
        let addresses = match proxy.and_then(|p| p.address.clone()) {
            Some(address) => vec![address],
            None => options.address.clone(),
        };

        let next = if addresses.is_empty() {
            self.selector.select(&service, &options.select).await?
        } else {
            Next::from_addresses(&service, &addresses)
        };
        Ok(Target {
            service,
            next,
            proxied: proxy.is_some(),
        })
    }
}

/// Runs up to `retries + 1` attempts in sequence.
///
/// Each attempt gets a child scope of `ctx` that is cancelled once the
/// orchestrator stops waiting for it, whether it finished or not.
pub(super) async fn run_attempts<T, F, Fut>(
    ctx: &CallContext,
    request: &Request,
    options: &CallOptions,
    retries: u32,
    attempt: F,
) -> Result<T, CallError>
where
    F: Fn(CallContext, u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    T: Send + 'static,
{
    let mut last = None;
    for number in 0..=retries {
        let scope = ctx.child();
        let _cancel_on_exit = scope.token().clone().drop_guard();
        let task = tokio::spawn(attempt(scope, number));

        let outcome = tokio::select! {
            biased;
            err = ctx.done() => {
                debug!(attempt = number, error = %err, "discarding in-flight attempt");
                return Err(err);
            }
            joined = task => joined.unwrap_or_else(|e| Err(join_failure(&e))),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_deadline() => return Err(err),
            Err(err) => err,
        };
        warn!(attempt = number, error = %err, "attempt failed");

        match (options.retry)(ctx, request, number, &err) {
            Err(verdict) => return Err(verdict),
            Ok(false) => return Err(err),
            Ok(true) => {
                debug!(attempt = number, retries, "retrying");
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or_else(|| CallError::internal(component::CLIENT, "no attempt was made")))
}

fn join_failure(err: &JoinError) -> CallError {
    if err.is_panic() {
        CallError::internal(component::CLIENT, "panic recovered")
    } else {
        CallError::internal(component::CLIENT, err)
    }
}

/// Sleeps for the backoff of attempt `number`, unless the scope ends first.
pub(super) async fn wait_backoff(
    scope: &CallContext,
    request: &Request,
    number: u32,
    backoff: &BackoffFn,
) -> Result<(), CallError> {
    let delay = backoff(scope, request, number)
        .map_err(|e| CallError::internal(component::CLIENT, format!("backoff error: {e}")))?;
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        err = scope.done() => Err(err),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// The innermost attempt service: one request/response exchange over a
/// pooled connection.
#[derive(Clone)]
struct Exchange {
    pool: Arc<Pool>,
    codecs: Arc<CodecRegistry>,
    seq: Arc<AtomicU64>,
}

impl Service<Attempt> for Exchange {
    type Response = Payload;
    type Error = CallError;
    type Future = BoxFuture<'static, Result<Payload, CallError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, attempt: Attempt) -> Self::Future {
        Box::pin(self.clone().exchange(attempt))
    }
}

impl Exchange {
    async fn exchange(self, attempt: Attempt) -> Result<Payload, CallError> {
        let Attempt {
            ctx,
            node,
            request,
            request_timeout,
            dial_timeout,
            ..
        } = attempt;

        let dial = DialOptions {
            timeout: dial_timeout,
            stream: false,
        };
        let conn = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            conn = self.pool.get(&node.address, &dial) => conn?,
        };

        let framer = match Framer::new(
            conn,
            &self.codecs,
            &node,
            request.content_type(),
            Some(request_timeout),
            ctx.metadata(),
        ) {
            Ok(framer) => framer,
            Err((err, conn)) => {
                self.pool.release(conn, Some(&err)).await;
                return Err(err);
            }
        };

        let id = self.seq.fetch_add(1, Ordering::Relaxed).to_string();
        let pool = Arc::clone(&self.pool);
        let release: Release = Box::new(
            move |framer: Framer, err: Option<CallError>| -> BoxFuture<'static, ()> {
                Box::pin(async move { pool.release(framer.into_connection(), err.as_ref()).await })
            },
        );
        let mut stream = Stream::new(ctx, &request, id, framer).with_release(release);

        let result = match stream.send(request.body()).await {
            Ok(()) => stream.recv().await.and_then(|reply| {
                reply.ok_or_else(|| {
                    CallError::protocol(component::CODEC, "stream ended without a response")
                })
            }),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            stream.fail(err.clone());
        }
        let _ = stream.close().await;
        result
    }
}
