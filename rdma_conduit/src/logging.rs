//! Process-wide log setup for binaries and demos built on this crate.
use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Selects JSON output when set to `json`.
pub const LOG_FORMAT_ENV: &str = "RDMA_CONDUIT_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

/// Installs a stderr subscriber filtered by `RUST_LOG` (default `info`).
///
/// Only the first call has an effect. If another global subscriber is already installed,
/// that one stays in place.
pub fn initialize_logging() {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format == "json");

        let layer = if json {
            fmt::Layer::default()
                .json()
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            fmt::Layer::default()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .boxed()
        };
        if let Err(err) = Registry::default().with(filter).with(layer).try_init() {
            eprintln!("failed to set subscriber: {}", err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_logging_twice() {
        initialize_logging();
        initialize_logging();
        tracing::info!("logging initialized");
    }
}
