//! CLI command implementations

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Subcommand;
use slipstream_core::config::{ConfigFile, ConfigPaths};
use slipstream_core::torrent::{OutputFormat, flatten_fields, format_torrent_info};
use slipstream_core::{DEFAULT_PAUSE_ID, RaceOutcome, RaceService, StatusFilter, TorrentFilter};
use tokio_util::sync::CancellationToken;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP API server
    Server {
        /// Host to bind to, overriding the config
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to, overriding the config
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Race a torrent in the foreground until its tracker works
    Race {
        /// Info hash of the torrent to race
        hash: String,
    },
    /// Resume the torrents paused for a finished race
    PostRace {
        /// Info hash of the raced torrent
        hash: String,
    },
    /// Pause torrents matching the configured activity limits
    Pause {
        /// Name of the pause, used to unpause it later
        #[arg(long, default_value = DEFAULT_PAUSE_ID)]
        id: String,
    },
    /// Resume the torrents of a previous pause
    Unpause {
        #[arg(long, default_value = DEFAULT_PAUSE_ID)]
        id: String,
    },
    /// List torrents known to the client
    Info {
        #[arg(long, value_enum, default_value_t = StatusFilter::All)]
        status: StatusFilter,
        /// Fields to show, comma separated or repeated
        #[arg(long)]
        fields: Vec<String>,
        #[arg(long)]
        include_field_names: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Show or edit the configuration file
    Config {
        #[arg(long)]
        print: bool,
        /// Open the file in $EDITOR
        #[arg(long, conflicts_with = "print")]
        edit: bool,
    },
    /// Inspect or clean up the pause database
    Db {
        #[arg(long)]
        print: bool,
        /// Forget every pause without resuming anything
        #[arg(long, conflicts_with_all = ["print", "delete"])]
        clear: bool,
        /// Forget one pause without resuming its torrents
        #[arg(long, conflicts_with = "print")]
        delete: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
///
/// - `ServiceError` - The underlying operation failed, see its `user_message`
/// - Config file access and server startup failures
pub async fn handle_command(command: Commands, paths: &ConfigPaths) -> anyhow::Result<()> {
    match command {
        Commands::Config { edit, .. } => config(paths, edit),
        Commands::Server { host, port } => server(paths, host, port).await,
        Commands::Race { hash } => race(&RaceService::open(paths).await?, &hash).await,
        Commands::PostRace { hash } => {
            let resumed = RaceService::open(paths).await?.finish_race(&hash).await?;
            println!("Resumed {} torrents", resumed.len());
            Ok(())
        }
        Commands::Pause { id } => {
            let obligation = RaceService::open(paths).await?.pause(&id, None).await?;
            println!("Paused {} torrents under [{}]", obligation.paused_set.len(), id);
            Ok(())
        }
        Commands::Unpause { id } => {
            let resumed = RaceService::open(paths).await?.unpause(&id).await?;
            println!("Resumed {} torrents from [{}]", resumed.len(), id);
            Ok(())
        }
        Commands::Info {
            status,
            fields,
            include_field_names,
            format,
        } => {
            let torrents = RaceService::open(paths)
                .await?
                .query_torrents(&TorrentFilter::with_status(status))
                .await?;
            let fields = (!fields.is_empty()).then(|| flatten_fields(&fields));
            let rendered =
                format_torrent_info(&torrents, fields.as_deref(), include_field_names, format)?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Db { clear, delete, .. } => {
            db(&RaceService::open(paths).await?, clear, delete).await
        }
    }
}

fn config(paths: &ConfigPaths, edit: bool) -> anyhow::Result<()> {
    let file = ConfigFile::new(paths.config_file());
    if edit {
        file.edit()?;
        println!("Saved {}", file.path().display());
        return Ok(());
    }
    println!("{}", file.path().display());
    println!("{}", file.read_raw()?);
    Ok(())
}

async fn server(paths: &ConfigPaths, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let service = RaceService::open(paths).await?;
    let mut server_config = service.config()?.server;
    if let Some(host) = host {
        server_config.host = host;
    }
    if let Some(port) = port {
        server_config.port = port;
    }

    let bind_address = server_config.bind_address();
    println!("Slipstream server running on http://{bind_address}");
    slipstream_web::run_server(Arc::new(service), &bind_address)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("server on {bind_address} failed"))
}

async fn race(service: &RaceService, hash: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping race");
            on_ctrl_c.cancel();
        }
    });

    let result = service.run_race(hash, cancel).await;
    watcher.abort();
    let report = result?;

    let name = report.name.as_deref().unwrap_or(hash);
    match report.outcome {
        RaceOutcome::Success => {
            println!(
                "Race for [{name}] succeeded after {} reannounces, {} torrents paused",
                report.attempts,
                report.paused.len()
            );
            Ok(())
        }
        RaceOutcome::Cancelled => {
            println!("Race for [{name}] cancelled, run post-race to resume paused torrents");
            Ok(())
        }
        RaceOutcome::LimitReached => bail!(
            "race for [{name}] gave up after {} reannounces, run post-race to resume paused torrents",
            report.attempts
        ),
    }
}

async fn db(service: &RaceService, clear: bool, delete: Option<String>) -> anyhow::Result<()> {
    if clear {
        let deleted = service.clear_obligations().await?;
        println!("Removed {deleted} entries");
        return Ok(());
    }
    if let Some(id) = delete {
        service.delete_obligation(&id).await?;
        println!("Removed [{id}]");
        return Ok(());
    }

    let obligations = service.list_obligations().await?;
    println!("{}", serde_json::to_string_pretty(&obligations)?);
    Ok(())
}
