//! Control façade over the ledger, race machine and task registry.
//!
//! The HTTP server and the CLI only call [`RaceService`]. Configuration is
//! re-read from the [`ConfigSource`] on every operation.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigFile, ConfigPaths, ConfigSource, HumanDuration, SlipstreamConfig};
use crate::gateway::{QbittorrentGateway, TorrentGateway};
use crate::ledger::{EligibilityCriteria, PauseLedger, PauseObligation};
use crate::race::{RaceMachine, RaceOutcome, RaceReport, RaceSettings};
use crate::tasks::{TaskError, TaskKind, TaskRegistry, TaskSnapshot};
use crate::torrent::{TorrentFilter, TorrentInfo};
use crate::Result;

/// Default obligation id for manual pauses.
pub const DEFAULT_PAUSE_ID: &str = "pause";

/// Per-call replacements for the configured manual pause criteria.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PauseOverride {
    pub ignore_categories: Option<Vec<String>>,
    pub time_since_active: Option<HumanDuration>,
    pub time_active: Option<HumanDuration>,
}

impl PauseOverride {
    fn apply(&self, config: &SlipstreamConfig) -> EligibilityCriteria {
        let mut config = config.clone();
        if let Some(categories) = &self.ignore_categories {
            config.ignore_categories = categories.clone();
        }
        if self.time_since_active.is_some() {
            config.pausing.time_since_active = self.time_since_active;
        }
        if self.time_active.is_some() {
            config.pausing.time_active = self.time_active;
        }
        config.pause_criteria()
    }
}

/// Single entry point for race, pause and task operations.
pub struct RaceService {
    gateway: Arc<dyn TorrentGateway>,
    ledger: Arc<PauseLedger>,
    registry: Arc<TaskRegistry>,
    config: Arc<dyn ConfigSource>,
}

impl RaceService {
    pub fn new(
        gateway: Arc<dyn TorrentGateway>,
        ledger: Arc<PauseLedger>,
        registry: Arc<TaskRegistry>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            registry,
            config,
        }
    }

    /// Builds the production service: config file, SQLite ledger and the
    /// qBittorrent gateway.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Config` - Config file unreadable or invalid
    /// - `ServiceError::Ledger` - Ledger database could not be opened
    /// - `ServiceError::Gateway` - Client URL invalid
    pub async fn open(paths: &ConfigPaths) -> Result<Self> {
        let file = ConfigFile::new(paths.config_file());
        let config = file.load()?;
        let gateway = QbittorrentGateway::new(&config.qbittorrent)?;
        let ledger = PauseLedger::open(&paths.database_file()).await?;
        let registry = TaskRegistry::new(config.task_retention.as_duration());

        Ok(Self::new(
            Arc::new(gateway),
            Arc::new(ledger),
            Arc::new(registry),
            Arc::new(file),
        ))
    }

    /// Current configuration.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Config` - Stored configuration unreadable or invalid
    pub fn config(&self) -> Result<SlipstreamConfig> {
        Ok(self.config.load()?)
    }

    /// Validates and stores a new configuration.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Config` - `config` invalid or not writable
    pub fn update_config(&self, config: &SlipstreamConfig) -> Result<()> {
        Ok(self.config.save(config)?)
    }

    pub fn config_location(&self) -> String {
        self.config.location()
    }

    /// Starts a race in the background, returning its task id.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Registry` - A race for `hash` is already running
    /// - `ServiceError::Config` - Configuration invalid
    pub fn start_race(&self, hash: &str) -> Result<String> {
        let settings = RaceSettings::from_config(&self.config.load()?)?;
        let gateway = Arc::clone(&self.gateway);
        let ledger = Arc::clone(&self.ledger);
        let hash = hash.to_string();

        let task_id = self
            .registry
            .spawn(TaskKind::Race, hash.clone(), move |ctx| async move {
                let machine = RaceMachine::new(gateway, ledger, settings, hash, ctx.token());
                let report = machine.run().await.map_err(|e| {
                    tracing::error!("Race task {} for [{}] failed: {}", ctx.id(), ctx.name(), e);
                    TaskError::fail(e)
                })?;
                match report.outcome {
                    RaceOutcome::Success => Ok(()),
                    RaceOutcome::Cancelled => Err(TaskError::Canceled),
                    RaceOutcome::LimitReached => Err(TaskError::fail(format!(
                        "reannounce limit reached after {} attempts",
                        report.attempts
                    ))),
                }
            })?;
        Ok(task_id)
    }

    /// Runs a race in the foreground until it ends or `cancel` fires.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Race` - Race could not start or failed mid-way
    /// - `ServiceError::Config` - Configuration invalid
    pub async fn run_race(&self, hash: &str, cancel: CancellationToken) -> Result<RaceReport> {
        let settings = RaceSettings::from_config(&self.config.load()?)?;
        let machine = RaceMachine::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.ledger),
            settings,
            hash,
            cancel,
        );
        Ok(machine.run().await?)
    }

    /// Resolves the race obligation for `hash` and resumes what is safe.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Ledger` - No obligation for `hash`
    /// - `ServiceError::Gateway` - Listing or resuming failed
    pub async fn finish_race(&self, hash: &str) -> Result<BTreeSet<String>> {
        self.resolve_and_resume(hash).await
    }

    /// Pauses torrents under obligation `id` using the configured activity
    /// limits, or `criteria_override` where given.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Ledger` - `id` already has a live obligation
    /// - `ServiceError::Gateway` - Listing or pausing failed
    pub async fn pause(
        &self,
        id: &str,
        criteria_override: Option<&PauseOverride>,
    ) -> Result<PauseObligation> {
        let config = self.config.load()?;
        let criteria = match criteria_override {
            Some(overrides) => overrides.apply(&config),
            None => config.pause_criteria(),
        };

        let _client = self.ledger.lock_client().await;
        let torrents = self.gateway.list_torrents(&TorrentFilter::all()).await?;
        let obligation = self
            .ledger
            .begin_with_selection(id, criteria, &torrents)
            .await?;

        if !obligation.paused_set.is_empty() {
            self.gateway.pause(&obligation.paused_set).await?;
        }
        tracing::info!(
            "Paused {} torrents under [{}]",
            obligation.paused_set.len(),
            id
        );
        Ok(obligation)
    }

    /// Resolves obligation `id` and resumes what is safe.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Ledger` - No obligation `id`
    /// - `ServiceError::Gateway` - Listing or resuming failed
    pub async fn unpause(&self, id: &str) -> Result<BTreeSet<String>> {
        self.resolve_and_resume(id).await
    }

    async fn resolve_and_resume(&self, id: &str) -> Result<BTreeSet<String>> {
        let _client = self.ledger.lock_client().await;
        let torrents = self.gateway.list_torrents(&TorrentFilter::all()).await?;
        let resumable = self.ledger.resolve_obligation(id, &torrents).await?;

        let (known, vanished): (BTreeSet<String>, BTreeSet<String>) = resumable
            .into_iter()
            .partition(|hash| torrents.iter().any(|torrent| torrent.hash == *hash));
        for hash in &vanished {
            tracing::warn!("Torrent {} is no longer in the client, not resuming it", hash);
        }

        if !known.is_empty() {
            self.gateway.resume(&known).await?;
        }
        tracing::info!("Resumed {} torrents for [{}]", known.len(), id);
        Ok(known)
    }

    /// # Errors
    ///
    /// - `ServiceError::Registry` - Task unknown or already finished
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        Ok(self.registry.cancel(task_id)?)
    }

    /// # Errors
    ///
    /// - `ServiceError::Registry` - Task unknown
    pub fn task_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        Ok(self.registry.status(task_id)?)
    }

    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.list()
    }

    /// Requests cancellation of every running task.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelling {} running tasks", cancelled);
        }
        cancelled
    }

    /// # Errors
    ///
    /// - `ServiceError::Gateway` - Client unavailable
    pub async fn query_torrents(&self, filter: &TorrentFilter) -> Result<Vec<TorrentInfo>> {
        Ok(self.gateway.list_torrents(filter).await?)
    }

    /// # Errors
    ///
    /// - `ServiceError::Ledger` - Storage read failed
    pub async fn list_obligations(&self) -> Result<Vec<PauseObligation>> {
        Ok(self.ledger.obligations().await?)
    }

    /// Drops obligation `id` without resuming its torrents.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Ledger` - No obligation `id`
    pub async fn delete_obligation(&self, id: &str) -> Result<()> {
        Ok(self.ledger.delete_obligation(id).await?)
    }

    /// Drops every obligation without resuming anything.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Ledger` - Storage write failed
    pub async fn clear_obligations(&self) -> Result<u64> {
        Ok(self.ledger.clear().await?)
    }
}
