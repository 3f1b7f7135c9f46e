//! Tracing setup: console output always, plus an optional daily
//! rolling log file.

use std::path::Path;

use anyhow::{Context as _, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const LOG_FILE_PREFIX: &str = "complaintflow.log";

/// Install the global subscriber. `log_level` is an `EnvFilter`
/// directive (e.g. `"info"` or `"complaintflow=debug,info"`); `RUST_LOG`
/// takes precedence when set. Returns the appender guard when file
/// logging is enabled; drop it only at process exit or buffered lines
/// are lost.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

            Registry::default()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .context("installing tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(filter)
                .with(console_layer)
                .try_init()
                .context("installing tracing subscriber")?;
            Ok(None)
        }
    }
}
