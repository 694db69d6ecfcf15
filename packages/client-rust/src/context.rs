//! Deadline and cancellation carrier for a call.
//!
//! A `CallContext` travels with every call, stream and publish. It combines an
//! optional absolute deadline, a [`CancellationToken`] and a metadata map
//! that is copied into every outgoing request header.

use std::collections::HashMap;
use std::time::Duration;

use stack_core::error::component;
use stack_core::CallError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEADLINE_EXCEEDED: &str = "context deadline exceeded";
const CANCELED: &str = "context canceled";

/// Cancellation scope, deadline and request metadata of a call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancellationToken,
    metadata: HashMap<String, String>,
}

impl CallContext {
    /// A fresh context with no deadline and no metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline to `timeout` from now (never later than an existing
    /// deadline).
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline. An earlier existing deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// A child scope: cancelling it leaves `self` untouched, cancelling
    /// `self` cancels the child. Deadline and metadata are inherited.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time left until the deadline, `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns the error describing why the context is done, or `None` while
    /// it is still live.
    #[must_use]
    pub fn err(&self) -> Option<CallError> {
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Some(CallError::timeout(component::CLIENT, DEADLINE_EXCEEDED));
        }
        if self.token.is_cancelled() {
            return Some(CallError::cancelled(component::CLIENT, CANCELED));
        }
        None
    }

    /// Resolves once the deadline passes or the token fires.
    pub async fn done(&self) -> CallError {
        if let Some(err) = self.err() {
            return err;
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => CallError::cancelled(component::CLIENT, CANCELED),
                () = tokio::time::sleep_until(deadline) => {
                    CallError::timeout(component::CLIENT, DEADLINE_EXCEEDED)
                }
            },
            None => {
                self.token.cancelled().await;
                CallError::cancelled(component::CLIENT, CANCELED)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use stack_core::ErrorKind;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_never_extends() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.with_timeout(Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn done_reports_timeout() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        assert!(ctx.err().is_none());
        let err = ctx.done().await;
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn child_cancellation_is_one_way() {
        let parent = CallContext::new().with_metadata("k", "v");
        let child = parent.child();
        child.cancel();
        assert!(parent.err().is_none());
        assert_eq!(child.err().unwrap().kind(), ErrorKind::Cancelled);
        assert_eq!(child.metadata().get("k").map(String::as_str), Some("v"));

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.done().await.kind(), ErrorKind::Cancelled);
    }
}
