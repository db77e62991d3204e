//! Tracing setup for hosts embedding the console core.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the log filter: configured level, else `RUST_LOG`, else `info`.
pub fn filter(config: &LoggingConfig) -> EnvFilter {
    config
        .log_level
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global fmt subscriber. Returns `false` when a subscriber was
/// already installed (e.g. by the host application).
pub fn init(config: &LoggingConfig) -> bool {
    fmt()
        .with_env_filter(filter(config))
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
