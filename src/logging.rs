use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,corner=debug,corner_lib=debug";

/// Installs the global subscriber: human-readable lines on stderr plus JSON lines in a daily file
/// under `logs_dir`. Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(logs_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
  let stderr = fmt::layer().with_target(true).with_writer(std::io::stderr);

  match logs_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "corner.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let file = fmt::layer().json().with_writer(writer);
      let installed = tracing_subscriber::registry().with(filter).with(stderr).with(file).try_init();
      installed.ok().map(|_| guard)
    }
    None => {
      let _ = tracing_subscriber::registry().with(filter).with(stderr).try_init();
      None
    }
  }
}
