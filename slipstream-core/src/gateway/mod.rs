//! Torrent client gateway abstractions and implementations.
//!
//! The race loop and the control façade only talk to the managed client
//! through [`TorrentGateway`]. Production uses the qBittorrent Web API;
//! tests use the in-process [`SimulatedGateway`].

pub mod qbittorrent;
#[cfg(any(test, feature = "test-utils"))]
pub mod simulated;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::torrent::{TorrentFilter, TorrentInfo};

pub use qbittorrent::QbittorrentGateway;
#[cfg(any(test, feature = "test-utils"))]
pub use simulated::{GatewayCall, SimulatedGateway};

/// Errors raised while talking to the torrent client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Torrent client unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Torrent client rejected login for user {username}")]
    LoginRejected { username: String },

    #[error("Torrent client returned HTTP {status} for {endpoint}")]
    UnexpectedStatus { endpoint: String, status: u16 },
}

impl GatewayError {
    pub(crate) fn unavailable(reason: impl std::fmt::Display) -> Self {
        GatewayError::Unavailable {
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        GatewayError::unavailable(error)
    }
}

/// Operations the core issues against the managed torrent client.
///
/// Every call is individually atomic and idempotent from the caller's
/// perspective. Sequences spanning several calls are serialized by the
/// caller through [`crate::PauseLedger::lock_client`].
#[async_trait]
pub trait TorrentGateway: Send + Sync {
    /// Lists torrents matching `filter`.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Client could not be reached
    async fn list_torrents(&self, filter: &TorrentFilter) -> Result<Vec<TorrentInfo>, GatewayError>;

    /// Pauses (stops) the given torrents.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Client could not be reached
    async fn pause(&self, hashes: &BTreeSet<String>) -> Result<(), GatewayError>;

    /// Resumes (starts) the given torrents.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Client could not be reached
    async fn resume(&self, hashes: &BTreeSet<String>) -> Result<(), GatewayError>;

    /// Re-sends the tracker announcement for one torrent.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Client could not be reached
    async fn reannounce(&self, hash: &str) -> Result<(), GatewayError>;

    /// Stops then starts one torrent.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Client could not be reached
    async fn restart(&self, hash: &str) -> Result<(), GatewayError>;

    /// Fetches a single torrent with its trackers, `None` if the client does
    /// not know it.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Client could not be reached
    async fn torrent(&self, hash: &str) -> Result<Option<TorrentInfo>, GatewayError> {
        let mut torrents = self
            .list_torrents(&TorrentFilter::single_with_trackers(hash))
            .await?;
        Ok(torrents
            .iter()
            .position(|torrent| torrent.hash == hash)
            .map(|index| torrents.swap_remove(index)))
    }
}
