//! Pause ledger: durable record of overlapping pause obligations.
//!
//! Each race or manual pause owns one obligation listing the torrents it
//! paused. When an obligation resolves, torrents another live obligation would
//! still select are handed over to that obligation instead of being resumed.
//! Every operation runs inside one critical section and one storage
//! transaction, so concurrent races always observe a consistent ledger.
//! Production ledgers live in SQLite; [`PauseLedger::in_memory`] keeps the
//! same semantics without persistence.
//!
//! Callers that list torrents, update the ledger and then pause or resume in
//! the client hold [`PauseLedger::lock_client`] across all three steps.

pub mod criteria;
pub mod resolution;
mod store;

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::{Mutex, MutexGuard};

pub use criteria::{EligibilityCriteria, PauseRule};
pub use resolution::{Resolution, resolve};

use crate::torrent::TorrentInfo;
use store::Backend;

/// Errors from ledger operations. Never retried by callers.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("A pause obligation with id {id} already exists")]
    DuplicateObligation { id: String },

    #[error("No pause obligation with id {id}")]
    UnknownObligation { id: String },

    #[error("Ledger storage failed: {reason}")]
    Storage { reason: String },
}

impl From<sqlx::Error> for LedgerError {
    fn from(error: sqlx::Error) -> Self {
        LedgerError::Storage {
            reason: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(error: serde_json::Error) -> Self {
        LedgerError::Storage {
            reason: format!("corrupt criteria snapshot: {error}"),
        }
    }
}

/// One live pause obligation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PauseObligation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub criteria: EligibilityCriteria,
    /// Torrents this obligation is responsible for resuming
    pub paused_set: BTreeSet<String>,
}

/// Pause obligations, persisted in SQLite or held in process.
pub struct PauseLedger {
    backend: Backend,
    lock: Mutex<()>,
    client_lock: Mutex<()>,
}

impl PauseLedger {
    /// Opens (creating if needed) the ledger database at `path`.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Storage` - Database could not be created or migrated
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Storage {
                    reason: format!("cannot create {}: {e}", parent.display()),
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let ledger = Self {
            backend: Backend::Sqlite(pool),
            lock: Mutex::new(()),
            client_lock: Mutex::new(()),
        };
        ledger.backend.migrate().await?;

        tracing::debug!("Opened pause ledger at {}", path.display());
        Ok(ledger)
    }

    /// Non-persistent ledger living only in this process.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(parking_lot::Mutex::new(Vec::new())),
            lock: Mutex::new(()),
            client_lock: Mutex::new(()),
        }
    }

    /// Serializes list, ledger update and client pause/resume sequences.
    ///
    /// Distinct from the per-operation lock, so ledger calls can be made
    /// while the guard is held. The torrent list used for selection or
    /// resolution must be fetched after acquiring it.
    pub async fn lock_client(&self) -> MutexGuard<'_, ()> {
        self.client_lock.lock().await
    }

    /// Records a new obligation pausing exactly `torrents_to_pause`.
    ///
    /// Must complete before any pause call reaches the client.
    ///
    /// # Errors
    ///
    /// - `LedgerError::DuplicateObligation` - `id` already has a live obligation
    /// - `LedgerError::Storage` - Database write failed
    pub async fn begin_obligation(
        &self,
        id: &str,
        criteria: EligibilityCriteria,
        torrents_to_pause: BTreeSet<String>,
    ) -> Result<PauseObligation, LedgerError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.backend.begin().await?;

        if tx.load_all().await?.iter().any(|o| o.id == id) {
            return Err(LedgerError::DuplicateObligation { id: id.to_string() });
        }

        let obligation = PauseObligation {
            id: id.to_string(),
            created_at: Utc::now(),
            criteria,
            paused_set: torrents_to_pause,
        };
        tx.insert(&obligation).await?;
        tx.commit().await?;

        tracing::info!(
            "Recorded pause obligation [{}] covering {} torrents",
            id,
            obligation.paused_set.len()
        );
        Ok(obligation)
    }

    /// Records a new obligation whose paused set is chosen from `torrents`
    /// inside the same critical section.
    ///
    /// Selected are the torrents `criteria` matches, excluding already paused
    /// ones, torrents another obligation already holds, `id` itself and every
    /// torrent that is the id of a live obligation.
    ///
    /// # Errors
    ///
    /// - `LedgerError::DuplicateObligation` - `id` already has a live obligation
    /// - `LedgerError::Storage` - Database read or write failed
    pub async fn begin_with_selection(
        &self,
        id: &str,
        criteria: EligibilityCriteria,
        torrents: &[TorrentInfo],
    ) -> Result<PauseObligation, LedgerError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.backend.begin().await?;

        let live = tx.load_all().await?;
        if live.iter().any(|obligation| obligation.id == id) {
            return Err(LedgerError::DuplicateObligation { id: id.to_string() });
        }

        let held: BTreeSet<&str> = live
            .iter()
            .flat_map(|obligation| {
                obligation
                    .paused_set
                    .iter()
                    .map(String::as_str)
                    .chain(std::iter::once(obligation.id.as_str()))
            })
            .collect();

        let paused_set: BTreeSet<String> = torrents
            .iter()
            .filter(|torrent| torrent.hash != id)
            .filter(|torrent| !torrent.state.is_paused())
            .filter(|torrent| !held.contains(torrent.hash.as_str()))
            .filter(|torrent| criteria.selects(torrent))
            .map(|torrent| torrent.hash.clone())
            .collect();

        let obligation = PauseObligation {
            id: id.to_string(),
            created_at: Utc::now(),
            criteria,
            paused_set,
        };
        tx.insert(&obligation).await?;
        tx.commit().await?;

        tracing::info!(
            "Recorded pause obligation [{}] selecting {} of {} torrents",
            id,
            obligation.paused_set.len(),
            torrents.len()
        );
        Ok(obligation)
    }

    /// Resolves obligation `id`, returning the torrents safe to resume.
    ///
    /// Torrents another live obligation would still select (judged against
    /// their state in `torrents`) are moved into that obligation's paused set.
    ///
    /// # Errors
    ///
    /// - `LedgerError::UnknownObligation` - No live obligation with `id`
    /// - `LedgerError::Storage` - Database read or write failed
    pub async fn resolve_obligation(
        &self,
        id: &str,
        torrents: &[TorrentInfo],
    ) -> Result<BTreeSet<String>, LedgerError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.backend.begin().await?;

        let mut live = tx.load_all().await?;
        let position = live
            .iter()
            .position(|obligation| obligation.id == id)
            .ok_or_else(|| LedgerError::UnknownObligation { id: id.to_string() })?;
        let resolving = live.remove(position);

        let resolution = resolve(&resolving.paused_set, &live, torrents);
        for (retainer, hashes) in &resolution.handover {
            tracing::info!(
                "Obligation [{}] takes over {} torrents from [{}]",
                retainer,
                hashes.len(),
                id
            );
            tx.add_paused(retainer, hashes).await?;
        }
        tx.delete(id).await?;
        tx.commit().await?;

        tracing::info!(
            "Resolved pause obligation [{}]: {} to resume, {} retained",
            id,
            resolution.resumable.len(),
            resolving.paused_set.len() - resolution.resumable.len()
        );
        Ok(resolution.resumable)
    }

    /// Live obligation ids in creation order.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Storage` - Database read failed
    pub async fn list_live(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .obligations()
            .await?
            .into_iter()
            .map(|obligation| obligation.id)
            .collect())
    }

    /// # Errors
    ///
    /// - `LedgerError::Storage` - Database read failed
    pub async fn obligation(&self, id: &str) -> Result<Option<PauseObligation>, LedgerError> {
        Ok(self
            .obligations()
            .await?
            .into_iter()
            .find(|obligation| obligation.id == id))
    }

    /// Every live obligation with its paused set, in creation order.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Storage` - Database read failed
    pub async fn obligations(&self) -> Result<Vec<PauseObligation>, LedgerError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.backend.begin().await?;
        let obligations = tx.load_all().await?;
        tx.commit().await?;
        Ok(obligations)
    }

    /// Drops obligation `id` without resuming anything.
    ///
    /// # Errors
    ///
    /// - `LedgerError::UnknownObligation` - No live obligation with `id`
    /// - `LedgerError::Storage` - Database write failed
    pub async fn delete_obligation(&self, id: &str) -> Result<(), LedgerError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.backend.begin().await?;
        if !tx.delete(id).await? {
            return Err(LedgerError::UnknownObligation { id: id.to_string() });
        }
        tx.commit().await?;
        tracing::info!("Deleted pause obligation [{}]", id);
        Ok(())
    }

    /// Drops every obligation, returning how many were removed.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Storage` - Database write failed
    pub async fn clear(&self) -> Result<u64, LedgerError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.backend.begin().await?;
        let removed = tx.delete_all().await?;
        tx.commit().await?;
        tracing::info!("Cleared {} pause obligations", removed);
        Ok(removed)
    }
}
