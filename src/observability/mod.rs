//! Observability
//!
//! `tracing` subscriber setup for the archiver binary. Library code only
//! emits events; the binary installs the subscriber once at startup.

pub mod config;

pub use config::{LogConfig, LogFormat};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Fails if one is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.default_filter))?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .try_init()?,
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init()?,
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.version,
        format = ?config.format,
        "tracing initialized"
    );
    Ok(())
}
