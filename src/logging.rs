//! Logging setup.
//!
//! Console output goes to stderr in the configured format. When a log file is
//! configured a second, non-blocking layer writes the same events to a
//! daily-rotated file without ANSI colors.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt::{self, MakeWriter},
  layer::SubscriberExt,
  util::SubscriberInitExt,
  EnvFilter, Layer, Registry,
};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => parse_filter(&config.level)?,
  };

  let mut layers = vec![format_layer(config.format, std::io::stderr, true)];

  let guard = match &config.file {
    Some(path) => {
      let (dir, name) = split_log_path(path)?;
      let appender = tracing_appender::rolling::daily(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      layers.push(format_layer(config.format, writer, false));
      Some(guard)
    }
    None => None,
  };

  tracing_subscriber::registry()
    .with(layers)
    .with(filter)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn parse_filter(level: &str) -> Result<EnvFilter> {
  EnvFilter::try_new(level).map_err(|e| eyre!("Invalid log level '{}': {}", level, e))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
  W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
  match format {
    LogFormat::Pretty => fmt::layer()
      .with_target(true)
      .with_ansi(ansi)
      .with_writer(writer)
      .boxed(),
    LogFormat::Compact => fmt::layer()
      .compact()
      .with_target(true)
      .with_ansi(ansi)
      .with_writer(writer)
      .boxed(),
    LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
  }
}

/// Split a log file path into the directory and the rotation prefix.
fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
  let name = path
    .file_name()
    .and_then(|n| n.to_str())
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

  let dir = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  };

  Ok((dir, name.to_string()))
}
