//! Per-call options and the built-in backoff / retry policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stack_core::{CallError, Request};

use crate::config::CallConfig;
use crate::context::CallContext;
use crate::middleware::CallWrapper;
use crate::selector::{Filter, SelectOptions, Strategy};

/// Delay before attempt `n` (zero-based). An error aborts the call.
pub type BackoffFn =
    Arc<dyn Fn(&CallContext, &Request, u32) -> Result<Duration, CallError> + Send + Sync>;

/// Whether to retry after attempt `n` failed with the given error. An error
/// aborts the call with that error.
pub type RetryFn = Arc<
    dyn Fn(&CallContext, &Request, u32, &CallError) -> Result<bool, CallError> + Send + Sync,
>;

/// Attempts past this one all wait [`MAX_BACKOFF`].
const MAX_BACKOFF_ATTEMPT: u32 = 13;
/// Longest delay the exponential backoff produces.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Exponential backoff: `floor(n^e)` times 100ms, capped at two minutes
/// past the thirteenth attempt. Attempt 0 never waits.
#[must_use]
pub fn exponential_backoff() -> BackoffFn {
    Arc::new(|_ctx: &CallContext, _req: &Request, attempt: u32| {
        Ok(exponential_delay(attempt))
    })
}

/// No delay between attempts.
#[must_use]
pub fn no_backoff() -> BackoffFn {
    Arc::new(|_ctx: &CallContext, _req: &Request, _attempt: u32| Ok(Duration::ZERO))
}

fn exponential_delay(attempt: u32) -> Duration {
    if attempt > MAX_BACKOFF_ATTEMPT {
        return MAX_BACKOFF;
    }
    let factor = f64::from(attempt).powf(std::f64::consts::E).floor();
    // `factor` is at most floor(13^e), far below u64::MAX.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let factor = factor as u64;
    Duration::from_millis(factor.saturating_mul(100))
}

/// Retries every failure except deadline and cancellation.
#[must_use]
pub fn retry_on_error() -> RetryFn {
    Arc::new(
        |_ctx: &CallContext, _req: &Request, _attempt: u32, err: &CallError| {
            Ok(!err.is_deadline())
        },
    )
}

/// Retries only connection-level failures (dial, pool, transport).
#[must_use]
pub fn retry_on_connection_error() -> RetryFn {
    Arc::new(
        |_ctx: &CallContext, _req: &Request, _attempt: u32, err: &CallError| {
            Ok(matches!(err, CallError::Connection { .. }))
        },
    )
}

/// Never retries.
#[must_use]
pub fn never_retry() -> RetryFn {
    Arc::new(|_ctx: &CallContext, _req: &Request, _attempt: u32, _err: &CallError| Ok(false))
}

/// Everything one call is configured with. Each call starts from a clone of
/// the client defaults.
#[derive(Clone)]
pub struct CallOptions {
    /// Fixed addresses tried in rotation instead of asking the selector.
    pub address: Vec<String>,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    /// Extra attempts after the first one.
    pub retries: u32,
    pub backoff: BackoffFn,
    pub retry: RetryFn,
    pub wrappers: Vec<CallWrapper>,
    pub select: SelectOptions,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::from_config(&CallConfig::default())
    }
}

impl CallOptions {
    #[must_use]
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            address: Vec::new(),
            request_timeout: config.request_timeout,
            dial_timeout: config.dial_timeout,
            retries: config.retries,
            backoff: exponential_backoff(),
            retry: retry_on_error(),
            wrappers: Vec::new(),
            select: SelectOptions::default(),
        }
    }

    /// Takes over the numeric settings of `config`, keeping the policies,
    /// wrappers and selection options.
    pub fn apply_config(&mut self, config: &CallConfig) {
        self.request_timeout = config.request_timeout;
        self.dial_timeout = config.dial_timeout;
        self.retries = config.retries;
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address.push(address.into());
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryFn) -> Self {
        self.retry = retry;
        self
    }

    /// Appends a wrapper; earlier wrappers run outside later ones.
    #[must_use]
    pub fn with_wrapper(mut self, wrapper: CallWrapper) -> Self {
        self.wrappers.push(wrapper);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.select.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.select.strategy = Some(strategy);
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("address", &self.address)
            .field("request_timeout", &self.request_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("retries", &self.retries)
            .field("wrappers", &self.wrappers)
            .field("select", &self.select)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use stack_core::error::component;
    use stack_core::Payload;

    use super::*;

    fn request() -> Request {
        Request::new("foo", "Foo.Bar", Payload::empty())
    }

    #[test]
    fn exponential_backoff_schedule() {
        assert_eq!(exponential_delay(0), Duration::ZERO);
        assert_eq!(exponential_delay(1), Duration::from_millis(100));
        // floor(2^e) = 6, floor(3^e) = 19
        assert_eq!(exponential_delay(2), Duration::from_millis(600));
        assert_eq!(exponential_delay(3), Duration::from_millis(1900));
        assert!(exponential_delay(13) < MAX_BACKOFF);
        assert_eq!(exponential_delay(14), MAX_BACKOFF);
        assert_eq!(exponential_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn default_retry_skips_deadline_errors() {
        let retry = retry_on_error();
        let ctx = CallContext::new();
        let req = request();
        let refused = CallError::connection(component::POOL, "refused");
        assert!(retry(&ctx, &req, 0, &refused).unwrap());
        assert!(retry(&ctx, &req, 0, &CallError::remote("boom")).unwrap());
        assert!(!retry(&ctx, &req, 0, &CallError::timeout(component::CLIENT, "late")).unwrap());
        assert!(!retry(&ctx, &req, 0, &CallError::cancelled(component::CLIENT, "stop")).unwrap());
    }

    #[test]
    fn connection_only_retry() {
        let retry = retry_on_connection_error();
        let ctx = CallContext::new();
        let req = request();
        let refused = CallError::connection(component::POOL, "refused");
        assert!(retry(&ctx, &req, 0, &refused).unwrap());
        assert!(!retry(&ctx, &req, 0, &CallError::remote("boom")).unwrap());
    }

    #[test]
    fn defaults_follow_call_config() {
        let config = CallConfig {
            retries: 4,
            request_timeout: Duration::from_secs(9),
            dial_timeout: Duration::from_secs(2),
        };
        let mut opts = CallOptions::default().with_address("a:1");
        opts.apply_config(&config);
        assert_eq!(opts.retries, 4);
        assert_eq!(opts.request_timeout, Duration::from_secs(9));
        assert_eq!(opts.dial_timeout, Duration::from_secs(2));
        assert_eq!(opts.address, vec!["a:1".to_string()]);
    }
}
