//! Tracing subscriber setup.
//!
//! Diagnostics go to stderr and, when enabled, to a daily rolling file in the
//! logs directory. Worker stdout/stderr lines are logged under the
//! `alex::worker::output` target, so the file doubles as the worker's
//! diagnostic sink.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log file name prefix inside the logs directory.
pub const LOG_FILE_PREFIX: &str = "alex-host.log";

/// Builds the filter: `RUST_LOG` if set, otherwise the configured directive.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
}

/// Installs the global subscriber.
///
/// Returns the file writer guard when file logging is on; keep it alive for
/// the life of the process or buffered lines are lost.
///
/// # Errors
///
/// Fails if the logs directory cannot be created or a global subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    if !config.file_enabled {
        tracing_subscriber::registry()
            .with(env_filter(config))
            .with(stderr_layer)
            .try_init()?;
        return Ok(None);
    }

    let dir = config.log_dir_path();
    std::fs::create_dir_all(&dir)?;
    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(dir = %dir.display(), "file logging enabled");
    Ok(Some(guard))
}
