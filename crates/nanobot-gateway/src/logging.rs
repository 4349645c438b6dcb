//! Process logging: human-readable stderr plus a daily-rotated file under the
//! data directory.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Returns the file-writer guard; hold it for
/// the life of the process or buffered lines are lost on exit.
pub fn init(verbose: bool, level: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let data_dir = nanobot_core::paths::data_dir();
    let file_appender = tracing_appender::rolling::daily(&data_dir, "gateway.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let directive = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nanobot={directive},warn")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    guard
}
