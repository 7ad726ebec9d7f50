//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level.

use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Install a global tracing subscriber.
///
/// Returns an error instead of panicking if a subscriber is already set, so
/// an embedding application keeps control of its own logging.
///
/// # Example
///
/// ```ignore
/// use offheap_cache::{LoggingConfig, logging};
///
/// logging::init(&LoggingConfig::default())?;
/// tracing::info!("allocator starting");
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names),
            )
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .try_init(),
        (LogFormat::Compact, true) => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names),
            )
            .try_init(),
        (LogFormat::Compact, false) => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .try_init(),
        (LogFormat::Json, true) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names),
            )
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .try_init(),
    }
}
