//! Client configuration types.

use std::time::Duration;

use stack_core::DEFAULT_CONTENT_TYPE;

use crate::transport::DEFAULT_DIAL_TIMEOUT;

/// Environment variable naming a proxy service every call is routed to.
pub const PROXY_SERVICE_ENV: &str = "STACK_PROXY";
/// Environment variable naming a proxy address every call is dialed to.
pub const PROXY_ADDRESS_ENV: &str = "STACK_PROXY_ADDRESS";

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Content type of requests that do not set one.
    pub content_type: String,
    pub pool: PoolConfig,
    pub call: CallConfig,
    pub proxy: Option<ProxyConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            pool: PoolConfig::default(),
            call: CallConfig::default(),
            proxy: None,
        }
    }
}

impl ClientConfig {
    /// Defaults plus proxy settings read from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            proxy: ProxyConfig::from_env(),
            ..Self::default()
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections kept per address.
    pub size: usize,
    /// Idle connections older than this are closed instead of reused.
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 100,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Defaults every call starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallConfig {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            request_timeout: Duration::from_secs(5),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Routes all traffic through a proxy. Retries are disabled while a proxy
/// is configured.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyConfig {
    /// Service name replacing every request's target (and publish topic).
    pub service: Option<String>,
    /// Address replacing node selection.
    pub address: Option<String>,
}

impl ProxyConfig {
    /// Reads `STACK_PROXY` / `STACK_PROXY_ADDRESS`. Empty values count as
    /// unset; `None` when neither is set.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let read = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let proxy = Self {
            service: read(PROXY_SERVICE_ENV),
            address: read(PROXY_ADDRESS_ENV),
        };
        proxy.is_active().then_some(proxy)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.service.is_some() || self.address.is_some()
    }
}
