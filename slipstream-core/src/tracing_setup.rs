//! Tracing setup for Slipstream
//!
//! Two outputs: console logs at the level the user picked, and a log file for
//! the last run in the logs directory. The file captures `debug` when
//! `debug_logging` is enabled in the config and `info` otherwise.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_FILENAME: &str = "slipstream-last-run.log";

/// Initialize tracing with console and file output.
///
/// `RUST_LOG` overrides the console level when set. Returns the path of the
/// log file written for this run, which overwrites the previous one.
///
/// # Errors
///
/// - `std::io::Error` - Logs directory cannot be created or the log file cannot be opened
/// - `tracing_subscriber::util::TryInitError` - A global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: &Path,
    debug_file: bool,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    create_dir_all(logs_dir)?;

    let log_file_path = logs_dir.join(LOG_FILENAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_level = if debug_file { Level::DEBUG } else { Level::INFO };
    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(file_level.to_string()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, file={} ({})",
        console_level,
        log_file_path.display(),
        file_level
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl CliLogLevel {
    /// Level for a count of `-v` flags: none is warn, `-v` info, `-vv` debug
    /// and anything beyond is trace.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => CliLogLevel::Warn,
            1 => CliLogLevel::Info,
            2 => CliLogLevel::Debug,
            _ => CliLogLevel::Trace,
        }
    }

    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(CliLogLevel::from_verbosity(0).as_tracing_level(), Level::WARN);
        assert_eq!(CliLogLevel::from_verbosity(1).as_tracing_level(), Level::INFO);
        assert_eq!(CliLogLevel::from_verbosity(2).as_tracing_level(), Level::DEBUG);
        assert_eq!(CliLogLevel::from_verbosity(7).as_tracing_level(), Level::TRACE);
    }
}
