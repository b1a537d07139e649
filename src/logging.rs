//! Tracing setup for the two ways gatekeeper runs.
//!
//! `serve` keeps an audit-friendly JSON trail on disk next to a readable
//! stderr stream. One-shot subcommands print their result as JSON on stdout,
//! so their logs go to stderr only.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::PathsConfig;

/// Log file prefix inside the logs directory.
pub const LOG_FILE_PREFIX: &str = "gatekeeper.log";

/// Filter used when `RUST_LOG` is unset. sqlx logs every statement at info.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Keeps the non-blocking file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _guard: WorkerGuard,
    logs_dir: PathBuf,
}

impl LoggingGuard {
    /// Directory the JSON trail is written to.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard")
            .field("logs_dir", &self.logs_dir)
            .finish_non_exhaustive()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialise logging for `serve` from the `[paths]` section.
///
/// `logs_dir` is resolved against `base_dir`, the config file's directory.
///
/// # Errors
///
/// See [`init_production`].
pub fn init_serve(paths: &PathsConfig, base_dir: &Path) -> anyhow::Result<LoggingGuard> {
    init_production(&PathsConfig::resolve(base_dir, &paths.logs_dir))
}

/// Write JSON to `{logs_dir}/gatekeeper.log.YYYY-MM-DD` and readable lines
/// to stderr, both filtered by `RUST_LOG` (default [`DEFAULT_FILTER`]).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LoggingGuard {
        _guard: guard,
        logs_dir: logs_dir.to_path_buf(),
    })
}

/// Initialise stderr-only logging for one-shot subcommands.
///
/// Calling it again in the same process keeps the first subscriber.
pub fn init_cli() {
    match tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => debug!("cli logging initialised"),
        Err(e) => debug!(error = %e, "keeping existing tracing subscriber"),
    }
}
