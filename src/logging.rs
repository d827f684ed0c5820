//! Logging Module
//!
//! Structured logging with file output for diagnostics.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "bus-tracker.log";

/// Initialize logging with console and file output.
///
/// Console output goes to stderr so it never interleaves with command output.
pub fn init(log_dir: &Path) {
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_appender);

    let console_layer = fmt::layer()
        .with_target(true)
        .compact()
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("debug,hyper=warn,reqwest=warn,rumqttc=warn")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("warn,bus_tracker_lib=info,hyper=warn,reqwest=warn,rumqttc=warn")
        }
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
