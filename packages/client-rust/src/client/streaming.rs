//! Stream establishment.
//!
//! Only establishing the stream (dial plus the first send) is retried.
//! Once established the stream belongs to the caller. A caller deadline
//! governs the whole stream; without one the request timeout bounds the
//! establishment only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stack_core::error::component;
use stack_core::{CallError, CodecRegistry, Node, Request};
use tracing::{debug, debug_span, Instrument};

use super::call::{run_attempts, wait_backoff};
use super::options::CallOptions;
use super::Client;
use crate::context::CallContext;
use crate::framer::Framer;
use crate::pool::Pool;
use crate::stream::Stream;
use crate::transport::{DialOptions, Transport};

impl Client {
    /// Opens a bidirectional stream with the client defaults. The request
    /// body is sent as the first message.
    ///
    /// # Errors
    ///
    /// The classified failure of the last establishment attempt, or
    /// `Timeout`/`Cancelled` when the context ended first.
    pub async fn stream(&self, ctx: &CallContext, request: Request) -> Result<Stream, CallError> {
        self.stream_with(ctx, request, |_| {}).await
    }

    /// Like [`Client::stream`], with `configure` adjusting a copy of the
    /// defaults for this stream only.
    ///
    /// # Errors
    ///
    /// See [`Client::stream`].
    pub async fn stream_with(
        &self,
        ctx: &CallContext,
        request: Request,
        configure: impl FnOnce(&mut CallOptions),
    ) -> Result<Stream, CallError> {
        let span = debug_span!(
            "stream",
            service = request.service(),
            endpoint = request.endpoint()
        );
        let state = self.state.load_full();
        let mut options = state.defaults.clone();
        configure(&mut options);

        async {
            let target = self.resolve(&state, &request, &options).await?;

            let establish = match ctx.remaining() {
                Some(remaining) => {
                    options.request_timeout = remaining;
                    ctx.clone()
                }
                None => ctx.clone().with_timeout(options.request_timeout),
            };
            if let Some(err) = establish.err() {
                return Err(err);
            }

            let retries = if target.proxied { 0 } else { options.retries };
            let request = Arc::new(request.streaming());
            let setup = Setup {
                transport: Arc::clone(&self.transport),
                pool: Arc::clone(&state.pool),
                codecs: Arc::clone(&self.codecs),
                seq: Arc::clone(&self.seq),
                request_timeout: options.request_timeout,
                dial_timeout: options.dial_timeout,
            };

            let attempt = |scope: CallContext, number: u32| {
                let setup = setup.clone();
                let next = target.next.clone();
                let service = target.service.clone();
                let selector = Arc::clone(&self.selector);
                let backoff = Arc::clone(&options.backoff);
                let request = Arc::clone(&request);
                let stream_ctx = ctx.child();
                async move {
                    wait_backoff(&scope, &request, number, &backoff).await?;
                    let node = next.next()?;
                    let result = setup.establish(&scope, stream_ctx, &node, &request).await;
                    selector.mark(&service, &node, result.as_ref().err());
                    result
                }
            };

            run_attempts(&establish, &request, &options, retries, attempt).await
        }
        .instrument(span)
        .await
    }
}

/// What one establishment attempt needs.
#[derive(Clone)]
struct Setup {
    transport: Arc<dyn Transport>,
    pool: Arc<Pool>,
    codecs: Arc<CodecRegistry>,
    seq: Arc<AtomicU64>,
    request_timeout: Duration,
    dial_timeout: Duration,
}

impl Setup {
    /// Dials a dedicated connection, frames it and sends the first
    /// message. `scope` bounds the establishment; `stream_ctx` governs the
    /// stream afterwards.
    async fn establish(
        &self,
        scope: &CallContext,
        stream_ctx: CallContext,
        node: &Node,
        request: &Request,
    ) -> Result<Stream, CallError> {
        let dial = DialOptions {
            timeout: self.dial_timeout,
            stream: true,
        };
        let conn = tokio::select! {
            biased;
            err = scope.done() => return Err(err),
            dialed = self.transport.dial(&node.address, &dial) => {
                dialed.map_err(|e| CallError::connection(component::TRANSPORT, e))?
            }
        };
        let conn = self.pool.adopt(conn);

        let framer = match Framer::new(
            conn,
            &self.codecs,
            node,
            request.content_type(),
            Some(self.request_timeout),
            stream_ctx.metadata(),
        ) {
            Ok(framer) => framer,
            Err((err, mut conn)) => {
                let _ = conn.close().await;
                return Err(err);
            }
        };

        let id = self.seq.fetch_add(1, Ordering::Relaxed).to_string();
        let mut stream = Stream::new(stream_ctx, request, id, framer).streaming();
        let sent = tokio::select! {
            biased;
            err = scope.done() => Err(err),
            sent = stream.send(request.body()) => sent,
        };
        if let Err(err) = sent {
            stream.fail(err.clone());
            let _ = stream.close().await;
            return Err(err);
        }
        debug!(stream_id = stream.id(), node = %node.address, "stream established");
        Ok(stream)
    }
}
