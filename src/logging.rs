//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "APICACHE_LOG";

const LOG_FILE: &str = "apicache.log";

/// Install the global subscriber.
///
/// Logs go to stderr, or to a daily-rolling file under `config.dir` when set.
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = build_filter(&config.level)?;

  if let Some(dir) = &config.dir {
    std::fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE));
    tracing_subscriber::registry()
      .with(filter)
      .with(
        tracing_subscriber::fmt::layer()
          .with_writer(writer)
          .with_ansi(false)
          .with_target(true),
      )
      .try_init()
      .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

    return Ok(Some(guard));
  }

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(None)
}

/// `APICACHE_LOG` when set, otherwise the configured directive.
fn build_filter(default_directive: &str) -> Result<EnvFilter> {
  match std::env::var(LOG_ENV) {
    Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(&directive)
      .map_err(|e| eyre!("Invalid {} directive {:?}: {}", LOG_ENV, directive, e)),
    _ => EnvFilter::try_new(default_directive)
      .map_err(|e| eyre!("Invalid log level {:?}: {}", default_directive, e)),
  }
}
