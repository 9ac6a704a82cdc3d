use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "clases.log";

/// Install the global subscriber.
///
/// Logs go to `<data_dir>/clases.log`, or to stderr when `to_stderr` is set.
/// The filter comes from `RUST_LOG` and defaults to `warn`. Keep the returned
/// guard alive until exit so buffered lines are flushed.
pub fn init(data_dir: &Path, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  if to_stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(
        tracing_subscriber::fmt::layer()
          .with_target(false)
          .with_writer(std::io::stderr),
      )
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  }

  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", data_dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(data_dir, LOG_FILE));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}
