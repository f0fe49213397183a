//! In-process gateway for deterministic tests.
//!
//! Holds a torrent table and per-hash tracker scripts. Every call is recorded
//! with the (tokio) instant it was issued so timing properties can be asserted
//! under a paused clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{GatewayError, TorrentGateway};
use crate::torrent::{TorrentFilter, TorrentInfo, TrackerEntry};

/// Operation recorded by [`SimulatedGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    List,
    Pause(BTreeSet<String>),
    Resume(BTreeSet<String>),
    Reannounce(String),
    Restart(String),
}

#[derive(Default)]
struct SimulatedState {
    torrents: BTreeMap<String, TorrentInfo>,
    /// Tracker lists served on successive lookups; the last one repeats
    tracker_scripts: HashMap<String, VecDeque<Vec<TrackerEntry>>>,
    calls: Vec<(Instant, GatewayCall)>,
    unavailable: bool,
}

/// Scripted torrent client.
#[derive(Default)]
pub struct SimulatedGateway {
    state: Mutex<SimulatedState>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gateway already holding `torrents`.
    pub fn with_torrents(torrents: impl IntoIterator<Item = TorrentInfo>) -> Self {
        let gateway = Self::new();
        for torrent in torrents {
            gateway.insert(torrent);
        }
        gateway
    }

    /// Adds or replaces a torrent.
    pub fn insert(&self, torrent: TorrentInfo) {
        self.state
            .lock()
            .torrents
            .insert(torrent.hash.clone(), torrent);
    }

    pub fn remove(&self, hash: &str) -> Option<TorrentInfo> {
        self.state.lock().torrents.remove(hash)
    }

    /// Applies `update` to a stored torrent; no-op when absent.
    pub fn update(&self, hash: &str, update: impl FnOnce(&mut TorrentInfo)) {
        if let Some(torrent) = self.state.lock().torrents.get_mut(hash) {
            update(torrent);
        }
    }

    pub fn get(&self, hash: &str) -> Option<TorrentInfo> {
        self.state.lock().torrents.get(hash).cloned()
    }

    /// Queues tracker lists returned by successive lookups of `hash`.
    pub fn script_trackers(&self, hash: &str, steps: impl IntoIterator<Item = Vec<TrackerEntry>>) {
        self.state
            .lock()
            .tracker_scripts
            .entry(hash.to_string())
            .or_default()
            .extend(steps);
    }

    /// Makes every following call fail with `GatewayError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// All recorded calls in issue order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Recorded calls with the instant each was issued.
    pub fn timed_calls(&self) -> Vec<(Instant, GatewayCall)> {
        self.state.lock().calls.clone()
    }

    /// Number of reannounce and restart calls for `hash`.
    pub fn attempt_count(&self, hash: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| {
                matches!(call, GatewayCall::Reannounce(h) | GatewayCall::Restart(h) if h == hash)
            })
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: GatewayCall) -> Result<parking_lot::MutexGuard<'_, SimulatedState>, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push((Instant::now(), call));
        if state.unavailable {
            return Err(GatewayError::unavailable("simulated outage"));
        }
        Ok(state)
    }
}

impl SimulatedState {
    fn next_trackers(&mut self, hash: &str) -> Option<Vec<TrackerEntry>> {
        let script = self.tracker_scripts.get_mut(hash)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }

    fn set_stopped(&mut self, hashes: &BTreeSet<String>, stopped: bool) {
        for hash in hashes {
            if let Some(torrent) = self.torrents.get_mut(hash) {
                torrent.state = if stopped {
                    torrent.state.stopped()
                } else {
                    torrent.state.resumed()
                };
            }
        }
    }
}

#[async_trait]
impl TorrentGateway for SimulatedGateway {
    async fn list_torrents(&self, filter: &TorrentFilter) -> Result<Vec<TorrentInfo>, GatewayError> {
        let mut state = self.record(GatewayCall::List)?;

        let selected: Vec<TorrentInfo> = state
            .torrents
            .values()
            .filter(|torrent| filter.status.matches(torrent))
            .filter(|torrent| {
                filter
                    .hashes
                    .as_ref()
                    .is_none_or(|hashes| hashes.iter().any(|hash| *hash == torrent.hash))
            })
            .cloned()
            .collect();

        if !filter.include_trackers {
            return Ok(selected);
        }

        Ok(selected
            .into_iter()
            .map(|mut torrent| {
                if let Some(trackers) = state.next_trackers(&torrent.hash) {
                    torrent.trackers = trackers;
                }
                torrent
            })
            .collect())
    }

    async fn pause(&self, hashes: &BTreeSet<String>) -> Result<(), GatewayError> {
        let mut state = self.record(GatewayCall::Pause(hashes.clone()))?;
        state.set_stopped(hashes, true);
        Ok(())
    }

    async fn resume(&self, hashes: &BTreeSet<String>) -> Result<(), GatewayError> {
        let mut state = self.record(GatewayCall::Resume(hashes.clone()))?;
        state.set_stopped(hashes, false);
        Ok(())
    }

    async fn reannounce(&self, hash: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Reannounce(hash.to_string()))?;
        Ok(())
    }

    async fn restart(&self, hash: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Restart(hash.to_string()))?;
        Ok(())
    }
}
