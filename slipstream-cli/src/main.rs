//! Slipstream CLI - Command-line interface
//!
//! One-shot commands against the torrent client and the pause database, plus
//! the long-running `server` command.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use slipstream_core::config::{ConfigFile, ConfigPaths, ConfigSource};
use slipstream_core::tracing_setup::{CliLogLevel, init_tracing};
use slipstream_core::ServiceError;

#[derive(Parser, Debug)]
#[command(name = "slipstream")]
#[command(about = "Reannounce racing and pause bookkeeping for qBittorrent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Increase console verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = ConfigPaths::from_env();

    // An unreadable config is reported by the command itself
    let debug_logging = ConfigFile::new(paths.config_file())
        .load()
        .map(|config| config.debug_logging)
        .unwrap_or(false);
    let level = CliLogLevel::from_verbosity(cli.verbose).as_tracing_level();
    if let Err(e) = init_tracing(level, &paths.logs_dir, debug_logging) {
        eprintln!("Warning: file logging unavailable: {e}");
    }

    match commands::handle_command(cli.command, &paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("Command failed: {:?}", e);
            match e.downcast_ref::<ServiceError>() {
                Some(service_error) => eprintln!("Error: {}", service_error.user_message()),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
