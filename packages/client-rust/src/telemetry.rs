//! Logging setup for processes embedding the client.

use std::sync::OnceLock;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Outcome of the one installation attempt, shared by every caller.
static INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

/// Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
/// [`DEFAULT_FILTER`]. Only the first call installs; later and concurrent
/// calls return its outcome.
///
/// # Errors
///
/// Returns an error if another subscriber was already installed globally.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    INSTALLED
        .get_or_init(|| install(format).map_err(|e| e.to_string()))
        .clone()
        .map_err(anyhow::Error::msg)
}

fn install(format: LogFormat) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_caller_sees_the_first_outcome() {
        let outcomes: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let format = if i % 2 == 0 { LogFormat::Json } else { LogFormat::Pretty };
                    s.spawn(move || init_tracing(format).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(init_tracing(LogFormat::Pretty).is_ok(), outcomes[0]);
    }
}
