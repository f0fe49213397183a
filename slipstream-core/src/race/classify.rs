//! Tracker message classification.

use serde::Serialize;

use crate::torrent::{TrackerEntry, TrackerStatus};

/// What the race loop should do after observing the trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackerClassification {
    /// At least one tracker accepted the torrent
    Working,
    /// Reannounce and wait the configured frequency
    Transient,
    /// Tracker has not indexed the torrent or dropped the connection
    RequiresRestart,
    /// Tracker asked us to back off
    RateLimited,
    /// A tracker is mid-announce; wait without reannouncing
    Updating,
    /// Nothing conclusive reported yet
    Unknown,
}

const RESTART_MARKERS: [&str; 2] = ["unregistered", "stream truncated"];
const RATE_LIMIT_MARKER: &str = "too many requests";

/// Classifies a torrent's tracker list.
///
/// Precedence: working, then restart, then rate limit, then updating, then
/// transient.
pub fn classify(trackers: &[TrackerEntry]) -> TrackerClassification {
    if trackers
        .iter()
        .any(|tracker| tracker.status == TrackerStatus::Working)
    {
        return TrackerClassification::Working;
    }

    let message = |tracker: &TrackerEntry| tracker.message.to_lowercase();

    if trackers.iter().any(|tracker| {
        tracker.status == TrackerStatus::NotWorking
            && RESTART_MARKERS
                .iter()
                .any(|marker| message(tracker).contains(marker))
    }) {
        return TrackerClassification::RequiresRestart;
    }

    if trackers.iter().any(|tracker| {
        matches!(tracker.status, TrackerStatus::NotWorking | TrackerStatus::Updating)
            && message(tracker).contains(RATE_LIMIT_MARKER)
    }) {
        return TrackerClassification::RateLimited;
    }

    if trackers
        .iter()
        .any(|tracker| tracker.status == TrackerStatus::Updating)
    {
        return TrackerClassification::Updating;
    }

    let contacted = trackers.iter().any(|tracker| {
        matches!(
            tracker.status,
            TrackerStatus::NotWorking | TrackerStatus::NotContacted
        )
    });
    if contacted {
        TrackerClassification::Transient
    } else {
        TrackerClassification::Unknown
    }
}
