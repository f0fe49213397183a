//! Torrent records as reported by the managed client.
//!
//! These types are the currency of the gateway boundary: the race loop reads
//! tracker state from them and the pause ledger evaluates eligibility
//! criteria against them.

pub mod report;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use report::{OutputFormat, flatten_fields, format_torrent_info};

/// Lifecycle state of a torrent inside the client.
///
/// Names follow the client's own wire values so records deserialize directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TorrentState {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "missingFiles")]
    MissingFiles,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "pausedUP", alias = "stoppedUP")]
    StoppedUpload,
    #[serde(rename = "queuedUP")]
    QueuedUpload,
    #[serde(rename = "stalledUP")]
    StalledUpload,
    #[serde(rename = "checkingUP")]
    CheckingUpload,
    #[serde(rename = "forcedUP")]
    ForcedUpload,
    #[serde(rename = "allocating")]
    Allocating,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "metaDL")]
    MetadataDownload,
    #[serde(rename = "forcedMetaDL")]
    ForcedMetadataDownload,
    #[serde(rename = "pausedDL", alias = "stoppedDL")]
    StoppedDownload,
    #[serde(rename = "queuedDL")]
    QueuedDownload,
    #[serde(rename = "stalledDL")]
    StalledDownload,
    #[serde(rename = "checkingDL")]
    CheckingDownload,
    #[serde(rename = "forcedDL")]
    ForcedDownload,
    #[serde(rename = "checkingResumeData")]
    CheckingResumeData,
    #[serde(rename = "moving")]
    Moving,
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl TorrentState {
    /// Returns true for paused/stopped torrents.
    pub fn is_paused(self) -> bool {
        matches!(self, Self::StoppedUpload | Self::StoppedDownload)
    }

    /// Returns true while the client is verifying local data.
    pub fn is_checking(self) -> bool {
        matches!(
            self,
            Self::CheckingUpload | Self::CheckingDownload | Self::CheckingResumeData
        )
    }

    /// Returns true once every piece is present locally.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            Self::Uploading
                | Self::StoppedUpload
                | Self::QueuedUpload
                | Self::StalledUpload
                | Self::CheckingUpload
                | Self::ForcedUpload
        )
    }

    /// State a stopped torrent returns to when resumed.
    pub fn resumed(self) -> Self {
        match self {
            Self::StoppedUpload => Self::Uploading,
            Self::StoppedDownload => Self::Downloading,
            other => other,
        }
    }

    /// State a running torrent enters when stopped.
    pub fn stopped(self) -> Self {
        if self.is_complete() {
            Self::StoppedUpload
        } else {
            Self::StoppedDownload
        }
    }
}

/// Tracker status codes reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Disabled,
    NotContacted,
    Working,
    Updating,
    NotWorking,
}

impl TrackerStatus {
    /// Maps the client's numeric status code.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::NotContacted,
            2 => Self::Working,
            3 => Self::Updating,
            4 => Self::NotWorking,
            _ => Self::Disabled,
        }
    }
}

/// One tracker attached to a torrent, with its latest message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub url: String,
    pub status: TrackerStatus,
    #[serde(default)]
    pub message: String,
}

impl TrackerEntry {
    pub fn new(url: impl Into<String>, status: TrackerStatus, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            message: message.into(),
        }
    }
}

/// Snapshot of a single torrent managed by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentInfo {
    /// Lowercase hex info hash
    pub hash: String,
    pub name: String,
    /// Category, `None` when uncategorised
    pub category: Option<String>,
    /// Share ratio (uploaded / downloaded)
    pub ratio: f64,
    /// Download progress (0.0 to 1.0)
    pub progress: f64,
    pub state: TorrentState,
    /// Time elapsed since the last upload or download activity
    #[serde(with = "duration_secs")]
    pub time_since_active: Duration,
    /// Total time the torrent has been running
    #[serde(with = "duration_secs")]
    pub time_active: Duration,
    /// Trackers and their latest messages, only filled when requested
    #[serde(default)]
    pub trackers: Vec<TrackerEntry>,
}

impl TorrentInfo {
    /// Creates a running, uncategorised torrent with zeroed statistics.
    pub fn new(hash: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            name: name.into(),
            category: None,
            ratio: 0.0,
            progress: 0.0,
            state: TorrentState::Downloading,
            time_since_active: Duration::ZERO,
            time_active: Duration::ZERO,
            trackers: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_state(mut self, state: TorrentState) -> Self {
        self.state = state;
        self
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_activity(mut self, time_since_active: Duration, time_active: Duration) -> Self {
        self.time_since_active = time_since_active;
        self.time_active = time_active;
        self
    }

    pub fn with_trackers(mut self, trackers: Vec<TrackerEntry>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Category name, empty when unset.
    pub fn category_name(&self) -> &str {
        self.category.as_deref().unwrap_or("")
    }
}

impl fmt::Display for TorrentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.hash)
    }
}

/// Status filter understood by the client's listing endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    Downloading,
    Seeding,
    Completed,
    Stopped,
    Running,
    Active,
    Inactive,
    Stalled,
    Errored,
}

impl StatusFilter {
    /// Wire value for the client's `filter` parameter.
    pub fn as_query(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Stalled => "stalled",
            Self::Errored => "errored",
        }
    }

    /// Local evaluation of the filter, used where the client is simulated.
    pub fn matches(self, torrent: &TorrentInfo) -> bool {
        let state = torrent.state;
        match self {
            Self::All => true,
            Self::Downloading => !state.is_complete() && !state.is_paused(),
            Self::Seeding => state.is_complete() && !state.is_paused(),
            Self::Completed => state.is_complete(),
            Self::Stopped => state.is_paused(),
            Self::Running => !state.is_paused(),
            Self::Active => !state.is_paused() && torrent.time_since_active.is_zero(),
            Self::Inactive => state.is_paused() || !torrent.time_since_active.is_zero(),
            Self::Stalled => matches!(
                state,
                TorrentState::StalledUpload | TorrentState::StalledDownload
            ),
            Self::Errored => matches!(state, TorrentState::Error | TorrentState::MissingFiles),
        }
    }
}

/// Selection passed to [`crate::gateway::TorrentGateway::list_torrents`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentFilter {
    pub status: StatusFilter,
    /// Restrict to these hashes; `None` lists everything
    pub hashes: Option<Vec<String>>,
    /// Fetch tracker entries for each returned torrent
    pub include_trackers: bool,
}

impl TorrentFilter {
    /// Every torrent, without tracker details.
    pub fn all() -> Self {
        Self::default()
    }

    /// A single torrent including its trackers.
    pub fn single_with_trackers(hash: &str) -> Self {
        Self {
            status: StatusFilter::All,
            hashes: Some(vec![hash.to_string()]),
            include_trackers: true,
        }
    }

    pub fn with_status(status: StatusFilter) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_hashes<I, S>(hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hashes: Some(hashes.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }
}

/// Serializes a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names_round_trip_v4_and_v5() {
        let v4: TorrentState = serde_json::from_str("\"pausedUP\"").unwrap();
        let v5: TorrentState = serde_json::from_str("\"stoppedUP\"").unwrap();
        assert_eq!(v4, TorrentState::StoppedUpload);
        assert_eq!(v5, TorrentState::StoppedUpload);

        let unknown: TorrentState = serde_json::from_str("\"somethingNew\"").unwrap();
        assert_eq!(unknown, TorrentState::Unknown);
    }

    #[test]
    fn test_state_predicates() {
        assert!(TorrentState::StoppedDownload.is_paused());
        assert!(!TorrentState::StoppedDownload.is_complete());
        assert!(TorrentState::CheckingResumeData.is_checking());
        assert!(TorrentState::StalledUpload.is_complete());
        assert_eq!(TorrentState::Uploading.stopped(), TorrentState::StoppedUpload);
        assert_eq!(TorrentState::StoppedDownload.resumed(), TorrentState::Downloading);
    }

    #[test]
    fn test_status_filter_matches_local_state() {
        let seeding = TorrentInfo::new("a", "seed").with_state(TorrentState::Uploading);
        let stopped = TorrentInfo::new("b", "stop").with_state(TorrentState::StoppedUpload);

        assert!(StatusFilter::Seeding.matches(&seeding));
        assert!(!StatusFilter::Seeding.matches(&stopped));
        assert!(StatusFilter::Stopped.matches(&stopped));
        assert!(StatusFilter::Completed.matches(&stopped));
        assert!(StatusFilter::All.matches(&stopped));
    }

    #[test]
    fn test_tracker_status_codes() {
        assert_eq!(TrackerStatus::from_code(2), TrackerStatus::Working);
        assert_eq!(TrackerStatus::from_code(4), TrackerStatus::NotWorking);
        assert_eq!(TrackerStatus::from_code(0), TrackerStatus::Disabled);
        assert_eq!(TrackerStatus::from_code(99), TrackerStatus::Disabled);
    }
}
