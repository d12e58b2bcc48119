//! Structured logging setup
//!
//! The library only emits `tracing` events. Applications that want them on
//! stderr call [`init_logging`] once at startup.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install a global subscriber according to `config`
///
/// `RUST_LOG` takes precedence over `config.filter` when set. Fails if a
/// global subscriber is already installed or the filter does not parse.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    installed.map_err(|e| Error::Config {
        message: format!("failed to install log subscriber: {e}"),
        key: None,
    })
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| Error::Config {
        message: format!("invalid log filter '{}': {e}", config.filter),
        key: Some("logging.filter".to_string()),
    })
}
