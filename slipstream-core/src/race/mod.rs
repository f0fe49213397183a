//! Race state machine.
//!
//! One [`RaceMachine`] drives a single racing torrent from validation through
//! pausing competitors to a registered tracker, an exhausted attempt budget or
//! cooperative cancellation:
//!
//! ```text
//! INIT -> PAUSING -> ANNOUNCING <-> RETRY_WAIT -> SUCCESS | LIMIT_REACHED | CANCELLED
//! ```
//!
//! Cancellation is only observed right after a wait, before the next gateway
//! call. Paused torrents stay paused when the race ends; resuming them is the
//! job of the separate post-race operation.

pub mod classify;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use classify::{TrackerClassification, classify};

use crate::config::{ConfigError, SlipstreamConfig};
use crate::gateway::{GatewayError, TorrentGateway};
use crate::ledger::{EligibilityCriteria, LedgerError, PauseLedger};
use crate::torrent::{TorrentFilter, TorrentInfo};

/// Backoff applied when a tracker rate limits us.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(10);

/// Poll interval while the client checks the racing torrent's data.
pub const CHECKING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that end a race before it reaches a terminal outcome.
#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("No torrent found with hash {hash}")]
    TorrentNotFound { hash: String },

    #[error("Torrent {hash} has category {category:?}, which is not a race category")]
    CategoryNotRaceable { hash: String, category: String },

    #[error("Torrent {hash} is paused")]
    TorrentPaused { hash: String },

    #[error("Torrent {hash} has already completed downloading")]
    AlreadyComplete { hash: String },

    #[error("Torrent {hash} disappeared from the client during the race")]
    TorrentVanished { hash: String },

    #[error("Torrent {hash} was stopped during the race")]
    TorrentStopped { hash: String },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Race parameters, taken from configuration when the race starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceSettings {
    /// Categories allowed to race; empty allows every torrent
    pub race_categories: BTreeSet<String>,
    /// Attempt budget; `None` retries until success or cancellation
    pub max_reannounce: Option<u32>,
    pub reannounce_frequency: Duration,
    /// Selection of competitors to pause; `None` disables pausing
    pub criteria: Option<EligibilityCriteria>,
}

impl RaceSettings {
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - Frequency is not a representable duration
    pub fn from_config(config: &SlipstreamConfig) -> Result<Self, ConfigError> {
        let racing = &config.racing;
        let reannounce_frequency = Duration::try_from_secs_f64(racing.reannounce_frequency)
            .map_err(|e| {
                ConfigError::invalid(format!(
                    "racing.reannounce_frequency {} is not a duration: {e}",
                    racing.reannounce_frequency
                ))
            })?;
        Ok(Self {
            race_categories: racing.race_categories.iter().cloned().collect(),
            max_reannounce: racing.max_reannounce.filter(|max| *max > 0),
            reannounce_frequency,
            criteria: racing.pausing.as_ref().map(|pausing| {
                EligibilityCriteria::race(
                    config.ignore_categories.iter().cloned(),
                    racing.race_categories.iter().cloned(),
                    pausing.ratio,
                )
            }),
        })
    }
}

impl Default for RaceSettings {
    fn default() -> Self {
        Self {
            race_categories: BTreeSet::new(),
            max_reannounce: None,
            reannounce_frequency: Duration::from_secs(5),
            criteria: Some(EligibilityCriteria::race(Vec::new(), Vec::new(), 0.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceState {
    Init,
    Pausing,
    Announcing,
    RetryWait,
    Success,
    LimitReached,
    Cancelled,
}

impl fmt::Display for RaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Pausing => "PAUSING",
            Self::Announcing => "ANNOUNCING",
            Self::RetryWait => "RETRY_WAIT",
            Self::Success => "SUCCESS",
            Self::LimitReached => "LIMIT_REACHED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceOutcome {
    Success,
    LimitReached,
    Cancelled,
}

impl From<RaceOutcome> for RaceState {
    fn from(outcome: RaceOutcome) -> Self {
        match outcome {
            RaceOutcome::Success => RaceState::Success,
            RaceOutcome::LimitReached => RaceState::LimitReached,
            RaceOutcome::Cancelled => RaceState::Cancelled,
        }
    }
}

/// Summary returned when a race reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceReport {
    pub hash: String,
    pub name: Option<String>,
    pub outcome: RaceOutcome,
    /// Reannounce and restart cycles issued
    pub attempts: u32,
    /// Torrents this race paused
    pub paused: BTreeSet<String>,
}

/// Drives one race. Consumed by [`RaceMachine::run`].
pub struct RaceMachine {
    gateway: Arc<dyn TorrentGateway>,
    ledger: Arc<PauseLedger>,
    settings: RaceSettings,
    hash: String,
    cancel: CancellationToken,
    state: RaceState,
    attempts: u32,
}

impl RaceMachine {
    pub fn new(
        gateway: Arc<dyn TorrentGateway>,
        ledger: Arc<PauseLedger>,
        settings: RaceSettings,
        hash: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            ledger,
            settings,
            hash: hash.into(),
            cancel,
            state: RaceState::Init,
            attempts: 0,
        }
    }

    /// Runs the race to a terminal outcome.
    ///
    /// # Errors
    ///
    /// - `RaceError::TorrentNotFound` - Racing torrent unknown to the client
    /// - `RaceError::CategoryNotRaceable` - Category outside the configured race categories
    /// - `RaceError::TorrentPaused` / `RaceError::AlreadyComplete` - Nothing to race
    /// - `RaceError::TorrentVanished` / `RaceError::TorrentStopped` - Torrent removed or stopped mid-race
    /// - `RaceError::Ledger` - Obligation could not be recorded
    /// - `RaceError::Gateway` - Listing or pausing failed before announcing
    pub async fn run(mut self) -> Result<RaceReport, RaceError> {
        let mut report = RaceReport {
            hash: self.hash.clone(),
            name: None,
            outcome: RaceOutcome::Cancelled,
            attempts: 0,
            paused: BTreeSet::new(),
        };

        let Some(racing) = self.init().await? else {
            self.transition(RaceState::Cancelled);
            return Ok(report);
        };
        report.name = Some(racing.name.clone());

        self.transition(RaceState::Pausing);
        report.paused = self.pause_competitors().await?;

        self.transition(RaceState::Announcing);
        let outcome = self.announce(&racing).await?;
        self.transition(outcome.into());

        report.outcome = outcome;
        report.attempts = self.attempts;
        tracing::info!(
            "Race for [{}] finished with {} after {} attempts",
            racing.name,
            self.state,
            self.attempts
        );
        Ok(report)
    }

    fn transition(&mut self, next: RaceState) {
        tracing::debug!("Race [{}]: {} -> {}", self.hash, self.state, next);
        self.state = next;
    }

    /// Validates the racing torrent. `None` when cancelled while it was checking.
    async fn init(&mut self) -> Result<Option<TorrentInfo>, RaceError> {
        let mut racing = self.fetch_racing().await?;

        if !self.settings.race_categories.is_empty()
            && !self.settings.race_categories.contains(racing.category_name())
        {
            tracing::info!(
                "Not racing [{}]: category [{}] is not one of {:?}",
                racing.name,
                racing.category_name(),
                self.settings.race_categories
            );
            return Err(RaceError::CategoryNotRaceable {
                hash: self.hash.clone(),
                category: racing.category_name().to_string(),
            });
        }

        while racing.state.is_checking() {
            tracing::debug!("Waiting while torrent [{}] is checking", racing.name);
            if self.wait(CHECKING_POLL_INTERVAL).await {
                return Ok(None);
            }
            racing = self.fetch_racing().await?;
        }

        if racing.state.is_paused() {
            return Err(RaceError::TorrentPaused {
                hash: self.hash.clone(),
            });
        }
        if racing.state.is_complete() {
            return Err(RaceError::AlreadyComplete {
                hash: self.hash.clone(),
            });
        }

        Ok(Some(racing))
    }

    async fn fetch_racing(&self) -> Result<TorrentInfo, RaceError> {
        self.gateway
            .list_torrents(&TorrentFilter::with_hashes([self.hash.as_str()]))
            .await?
            .into_iter()
            .find(|torrent| torrent.hash == self.hash)
            .ok_or_else(|| RaceError::TorrentNotFound {
                hash: self.hash.clone(),
            })
    }

    /// Selects, records and pauses competitors under the ledger's client lock,
    /// listing torrents afresh so the selection reflects the client's
    /// current pause state.
    async fn pause_competitors(&mut self) -> Result<BTreeSet<String>, RaceError> {
        let criteria = match &self.settings.criteria {
            Some(criteria) => criteria.clone().with_exempt(self.hash.clone()),
            None => {
                tracing::info!("Pausing is disabled, no torrents will be paused");
                EligibilityCriteria::nothing()
            }
        };

        let _client = self.ledger.lock_client().await;
        let torrents = self.gateway.list_torrents(&TorrentFilter::all()).await?;
        let obligation = self
            .ledger
            .begin_with_selection(&self.hash, criteria, &torrents)
            .await?;

        if !obligation.paused_set.is_empty() {
            tracing::info!(
                "Pausing {} torrents for race [{}]",
                obligation.paused_set.len(),
                self.hash
            );
            self.gateway.pause(&obligation.paused_set).await?;
        }
        Ok(obligation.paused_set)
    }

    async fn announce(&mut self, racing: &TorrentInfo) -> Result<RaceOutcome, RaceError> {
        loop {
            let classification = self.observe().await?;
            if classification == TrackerClassification::Working {
                tracing::info!("Tracker is working for [{}]", racing.name);
                return Ok(RaceOutcome::Success);
            }

            let wait = match classification {
                TrackerClassification::RateLimited => {
                    tracing::info!(
                        "Tracker rate limited [{}], backing off for {:?}",
                        racing.name,
                        RATE_LIMIT_BACKOFF
                    );
                    RATE_LIMIT_BACKOFF
                }
                _ if self.limit_reached() => return Ok(RaceOutcome::LimitReached),
                TrackerClassification::Updating => {
                    tracing::debug!("Waiting on [{}] while trackers are updating", racing.name);
                    self.settings.reannounce_frequency
                }
                TrackerClassification::RequiresRestart => {
                    self.attempts += 1;
                    tracing::info!(
                        "Restarting [{}], attempt {} of {}",
                        racing.name,
                        self.attempts,
                        self.budget()
                    );
                    if let Err(e) = self.gateway.restart(&self.hash).await {
                        tracing::warn!("Restart of [{}] failed: {}", racing.name, e);
                    }
                    self.settings.reannounce_frequency
                }
                _ => {
                    self.attempts += 1;
                    tracing::info!(
                        "Sent reannounce {} of {} for [{}]",
                        self.attempts,
                        self.budget(),
                        racing.name
                    );
                    if let Err(e) = self.gateway.reannounce(&self.hash).await {
                        tracing::warn!("Reannounce of [{}] failed: {}", racing.name, e);
                    }
                    self.settings.reannounce_frequency
                }
            };

            self.transition(RaceState::RetryWait);
            if self.wait(wait).await {
                return Ok(RaceOutcome::Cancelled);
            }
            self.transition(RaceState::Announcing);
        }
    }

    async fn observe(&self) -> Result<TrackerClassification, RaceError> {
        match self.gateway.torrent(&self.hash).await {
            Ok(Some(torrent)) if torrent.state.is_paused() => Err(RaceError::TorrentStopped {
                hash: self.hash.clone(),
            }),
            Ok(Some(torrent)) => Ok(classify(&torrent.trackers)),
            Ok(None) => Err(RaceError::TorrentVanished {
                hash: self.hash.clone(),
            }),
            Err(e) => {
                tracing::warn!("Could not read trackers for [{}]: {}", self.hash, e);
                Ok(TrackerClassification::Transient)
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.settings
            .max_reannounce
            .is_some_and(|max| self.attempts >= max)
    }

    fn budget(&self) -> String {
        self.settings
            .max_reannounce
            .map_or_else(|| "unlimited".to_string(), |max| max.to_string())
    }

    /// Sleeps for `duration`, returning true when cancellation was requested.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
        if self.cancel.is_cancelled() {
            tracing::info!("Race [{}] cancelled", self.hash);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::gateway::{GatewayCall, SimulatedGateway};
    use crate::torrent::{TorrentState, TrackerEntry, TrackerStatus};

    const RACE: &str = "racehash";

    fn trackers(status: TrackerStatus, message: &str) -> Vec<TrackerEntry> {
        vec![TrackerEntry::new("https://tracker.example/announce", status, message)]
    }

    fn settings(max: Option<u32>) -> RaceSettings {
        RaceSettings {
            max_reannounce: max,
            reannounce_frequency: Duration::from_secs(5),
            ..RaceSettings::default()
        }
    }

    fn world() -> Arc<SimulatedGateway> {
        Arc::new(SimulatedGateway::with_torrents([
            TorrentInfo::new(RACE, "New.Release"),
            TorrentInfo::new("seed1", "Old.Seed").with_state(TorrentState::Uploading),
            TorrentInfo::new("seed2", "Other.Seed").with_state(TorrentState::StalledUpload),
            TorrentInfo::new("stopped", "Stopped").with_state(TorrentState::StoppedUpload),
        ]))
    }

    async fn machine(
        gateway: &Arc<SimulatedGateway>,
        settings: RaceSettings,
        cancel: CancellationToken,
    ) -> (RaceMachine, Arc<PauseLedger>) {
        let ledger = Arc::new(PauseLedger::in_memory());
        let machine = RaceMachine::new(gateway.clone(), ledger.clone(), settings, RACE, cancel);
        (machine, ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_pauses_competitors_and_keeps_them_paused() {
        let gateway = world();
        gateway.script_trackers(
            RACE,
            [
                trackers(TrackerStatus::NotWorking, "torrent not found"),
                trackers(TrackerStatus::Working, ""),
            ],
        );
        let (machine, ledger) = machine(&gateway, settings(None), CancellationToken::new()).await;

        let report = machine.run().await.unwrap();

        assert_eq!(report.outcome, RaceOutcome::Success);
        assert_eq!(report.attempts, 1);
        let expected: BTreeSet<String> = ["seed1", "seed2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(report.paused, expected);
        assert!(gateway.calls().contains(&GatewayCall::Pause(expected.clone())));
        assert!(gateway.get("seed1").unwrap().state.is_paused());
        assert_eq!(ledger.list_live().await.unwrap(), vec![RACE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_reached_after_exactly_n_attempts() {
        let gateway = world();
        gateway.script_trackers(RACE, [trackers(TrackerStatus::NotWorking, "timed out")]);
        let (machine, _) = machine(&gateway, settings(Some(3)), CancellationToken::new()).await;

        let report = machine.run().await.unwrap();

        assert_eq!(report.outcome, RaceOutcome::LimitReached);
        assert_eq!(report.attempts, 3);
        assert_eq!(gateway.attempt_count(RACE), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_restarts_instead_of_reannouncing() {
        let gateway = world();
        gateway.script_trackers(
            RACE,
            [
                trackers(TrackerStatus::NotWorking, "Unregistered torrent"),
                trackers(TrackerStatus::Working, ""),
            ],
        );
        let (machine, _) = machine(&gateway, settings(None), CancellationToken::new()).await;

        machine.run().await.unwrap();

        let calls = gateway.calls();
        assert!(calls.contains(&GatewayCall::Restart(RACE.to_string())));
        assert!(!calls.contains(&GatewayCall::Reannounce(RACE.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_fixed_backoff_without_counting() {
        let gateway = world();
        gateway.script_trackers(
            RACE,
            [
                trackers(TrackerStatus::NotWorking, "too many requests"),
                trackers(TrackerStatus::Working, ""),
            ],
        );
        let mut race_settings = settings(Some(1));
        race_settings.reannounce_frequency = Duration::from_secs(1);
        let (machine, _) = machine(&gateway, race_settings, CancellationToken::new()).await;

        let report = machine.run().await.unwrap();
        assert_eq!(report.outcome, RaceOutcome::Success);
        assert_eq!(report.attempts, 0);

        let lookups: Vec<Instant> = gateway
            .timed_calls()
            .into_iter()
            .filter(|(_, call)| *call == GatewayCall::List)
            .map(|(at, _)| at)
            .collect();
        let (first, second) = (lookups[lookups.len() - 2], lookups[lookups.len() - 1]);
        assert_eq!(second - first, RATE_LIMIT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updating_tracker_waits_without_reannouncing() {
        let gateway = world();
        gateway.script_trackers(
            RACE,
            [
                trackers(TrackerStatus::Updating, ""),
                trackers(TrackerStatus::Updating, ""),
                trackers(TrackerStatus::Working, ""),
            ],
        );
        let (machine, _) = machine(&gateway, settings(Some(1)), CancellationToken::new()).await;

        let report = machine.run().await.unwrap();

        assert_eq!(report.outcome, RaceOutcome::Success);
        assert_eq!(report.attempts, 0);
        assert_eq!(gateway.attempt_count(RACE), 0);
        let lookups: Vec<Instant> = gateway
            .timed_calls()
            .into_iter()
            .filter(|(_, call)| *call == GatewayCall::List)
            .map(|(at, _)| at)
            .collect();
        let (first, second) = (lookups[lookups.len() - 2], lookups[lookups.len() - 1]);
        assert_eq!(second - first, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_wait_issues_no_further_calls() {
        let gateway = world();
        gateway.script_trackers(RACE, [trackers(TrackerStatus::NotWorking, "timed out")]);
        let cancel = CancellationToken::new();
        let (machine, _) = machine(&gateway, settings(None), cancel.clone()).await;

        let race = tokio::spawn(machine.run());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let calls_before = gateway.calls().len();
        cancel.cancel();

        let report = race.await.unwrap().unwrap();
        assert_eq!(report.outcome, RaceOutcome::Cancelled);
        assert_eq!(report.attempts, 1);
        assert_eq!(gateway.calls().len(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pausing_disabled_records_empty_obligation() {
        let gateway = world();
        gateway.script_trackers(RACE, [trackers(TrackerStatus::Working, "")]);
        let race_settings = RaceSettings {
            criteria: None,
            ..settings(None)
        };
        let (machine, ledger) = machine(&gateway, race_settings, CancellationToken::new()).await;

        let report = machine.run().await.unwrap();

        assert!(report.paused.is_empty());
        assert!(!gateway.calls().iter().any(|call| matches!(call, GatewayCall::Pause(_))));
        let obligation = ledger.obligation(RACE).await.unwrap().unwrap();
        assert_eq!(obligation.criteria, EligibilityCriteria::nothing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_rejections() {
        let gateway = world();
        gateway.insert(TorrentInfo::new("done", "Done").with_state(TorrentState::Uploading));
        gateway.insert(TorrentInfo::new("tv", "Show").with_category("tv"));

        let ledger = Arc::new(PauseLedger::in_memory());
        let run = |hash: &str, settings: RaceSettings| {
            RaceMachine::new(
                gateway.clone(),
                ledger.clone(),
                settings,
                hash,
                CancellationToken::new(),
            )
            .run()
        };

        assert!(matches!(
            run("missing", settings(None)).await,
            Err(RaceError::TorrentNotFound { .. })
        ));
        assert!(matches!(
            run("stopped", settings(None)).await,
            Err(RaceError::TorrentPaused { .. })
        ));
        assert!(matches!(
            run("done", settings(None)).await,
            Err(RaceError::AlreadyComplete { .. })
        ));

        let categorised = RaceSettings {
            race_categories: ["movies".to_string()].into(),
            ..settings(None)
        };
        assert!(matches!(
            run("tv", categorised).await,
            Err(RaceError::CategoryNotRaceable { category, .. }) if category == "tv"
        ));
        assert!(ledger.list_live().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_checking_then_races() {
        let gateway = world();
        gateway.update(RACE, |torrent| torrent.state = TorrentState::CheckingDownload);
        gateway.script_trackers(RACE, [trackers(TrackerStatus::Working, "")]);
        let (machine, _) = machine(&gateway, settings(None), CancellationToken::new()).await;

        let race = tokio::spawn(machine.run());
        tokio::time::sleep(Duration::from_millis(350)).await;
        gateway.update(RACE, |torrent| torrent.state = TorrentState::Downloading);

        let report = race.await.unwrap().unwrap();
        assert_eq!(report.outcome, RaceOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_mid_race_fails() {
        let gateway = world();
        gateway.script_trackers(RACE, [trackers(TrackerStatus::NotWorking, "timed out")]);
        let (machine, _) = machine(&gateway, settings(None), CancellationToken::new()).await;

        let race = tokio::spawn(machine.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        gateway.update(RACE, |torrent| torrent.state = TorrentState::StoppedDownload);

        assert!(matches!(
            race.await.unwrap(),
            Err(RaceError::TorrentStopped { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_outage_while_announcing_is_transient() {
        let gateway = world();
        gateway.script_trackers(RACE, [trackers(TrackerStatus::NotWorking, "timed out")]);
        let (machine, _) = machine(&gateway, settings(Some(2)), CancellationToken::new()).await;

        let race = tokio::spawn(machine.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        gateway.set_unavailable(true);

        let report = race.await.unwrap().unwrap();
        assert_eq!(report.outcome, RaceOutcome::LimitReached);
        assert_eq!(gateway.attempt_count(RACE), 2);
    }
}
