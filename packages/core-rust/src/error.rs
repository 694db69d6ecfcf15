//! Error taxonomy of the call engine.
//!
//! Every error a caller can observe from a call, stream or publish is a
//! [`CallError`]. Local variants carry the identifier of the component that
//! produced them so an outer layer (e.g. an HTTP gateway) can map them to its
//! own status codes via [`CallError::status_code`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifiers of the components that originate errors.
pub mod component {
    pub const CLIENT: &str = "stack.client";
    pub const SELECTOR: &str = "stack.client.selector";
    pub const POOL: &str = "stack.client.pool";
    pub const CODEC: &str = "stack.client.codec";
    pub const TRANSPORT: &str = "stack.client.transport";
    pub const BROKER: &str = "stack.client.broker";
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Structured error returned by a callee in the message error field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub status: String,
}

impl RemoteError {
    #[must_use]
    pub fn new(id: impl Into<String>, code: i32, detail: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code,
            detail: detail.into(),
            status: status_text(code).to_string(),
        }
    }

    /// Parses the error text a peer sent. JSON of the form
    /// `{"id","code","detail","status"}` is decoded; anything else becomes
    /// the detail of a 500 error.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Self>(text) {
            Ok(err) if err.code != 0 || !err.detail.is_empty() => err,
            _ => Self::new("", 500, text),
        }
    }

    /// JSON text suitable for the error header of a response.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.detail.clone())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{} ({})", self.detail, self.code)
        } else {
            write!(f, "{}: {} ({})", self.id, self.detail, self.code)
        }
    }
}

fn status_text(code: i32) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

// ---------------------------------------------------------------------------
// CallError
// ---------------------------------------------------------------------------

/// Coarse classification of a [`CallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NoneAvailable,
    Connection,
    Protocol,
    Remote,
    Timeout,
    Cancelled,
    Internal,
}

/// User-visible error of a call, stream or publish.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CallError {
    #[error("{component}: service {service}: not found")]
    NotFound {
        component: &'static str,
        service: String,
    },
    #[error("{component}: service {service}: none available")]
    NoneAvailable {
        component: &'static str,
        service: String,
    },
    #[error("{component}: connection error: {detail}")]
    Connection {
        component: &'static str,
        detail: String,
    },
    #[error("{component}: protocol error: {detail}")]
    Protocol {
        component: &'static str,
        detail: String,
    },
    #[error("remote error: {0}")]
    Remote(RemoteError),
    #[error("{component}: timeout: {detail}")]
    Timeout {
        component: &'static str,
        detail: String,
    },
    #[error("{component}: cancelled: {detail}")]
    Cancelled {
        component: &'static str,
        detail: String,
    },
    #[error("{component}: {detail}")]
    Internal {
        component: &'static str,
        detail: String,
    },
}

impl CallError {
    pub fn connection(component: &'static str, detail: impl fmt::Display) -> Self {
        Self::Connection {
            component,
            detail: detail.to_string(),
        }
    }

    pub fn protocol(component: &'static str, detail: impl fmt::Display) -> Self {
        Self::Protocol {
            component,
            detail: detail.to_string(),
        }
    }

    pub fn timeout(component: &'static str, detail: impl fmt::Display) -> Self {
        Self::Timeout {
            component,
            detail: detail.to_string(),
        }
    }

    pub fn cancelled(component: &'static str, detail: impl fmt::Display) -> Self {
        Self::Cancelled {
            component,
            detail: detail.to_string(),
        }
    }

    pub fn internal(component: &'static str, detail: impl fmt::Display) -> Self {
        Self::Internal {
            component,
            detail: detail.to_string(),
        }
    }

    /// Builds a remote error from the peer's error text.
    #[must_use]
    pub fn remote(text: &str) -> Self {
        Self::Remote(RemoteError::parse(text))
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NoneAvailable { .. } => ErrorKind::NoneAvailable,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Component that produced the error; `None` for remote errors.
    #[must_use]
    pub fn component(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { component, .. }
            | Self::NoneAvailable { component, .. }
            | Self::Connection { component, .. }
            | Self::Protocol { component, .. }
            | Self::Timeout { component, .. }
            | Self::Cancelled { component, .. }
            | Self::Internal { component, .. } => Some(*component),
            Self::Remote(_) => None,
        }
    }

    /// Returns `true` for errors that mean the caller stopped waiting.
    #[must_use]
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }

    /// HTTP-flavoured status code for gateways.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } | Self::Cancelled { .. } => 408,
            Self::Remote(err) => u16::try_from(err.code)
                .ok()
                .filter(|c| (100..600).contains(c))
                .unwrap_or(500),
            _ => 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
