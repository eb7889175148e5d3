use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILTER_VAR: &str = "TISSAIA_LOG";
pub const LOG_FILE_NAME: &str = "tissaia.log";

fn filter_directive(value: Option<String>) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Installs stdout and file logging. Keep the returned guard alive for the
/// lifetime of the process or buffered file lines are lost.
pub fn init_logger(log_dir: &Path) -> WorkerGuard {
    let filter = filter_directive(env::var(LOG_FILTER_VAR).ok());
    let filter_layer = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter_layer)
        .try_init();

    match installed {
        Ok(()) => tracing::info!(filter = %filter, log_dir = %log_dir.display(), "logging initialised"),
        Err(err) => eprintln!("tracing subscriber already installed: {}", err),
    }

    guard
}
