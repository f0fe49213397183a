//! Storage backends for pause obligations.
//!
//! The ledger opens one [`StoreTransaction`] per operation. SQLite commits
//! through a real transaction; the in-process backend works on a copy of the
//! table and swaps it in on commit.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use super::{EligibilityCriteria, LedgerError, PauseObligation};

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS pause_events (
        id TEXT PRIMARY KEY NOT NULL,
        created_at TEXT NOT NULL,
        criteria TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS paused_torrents (
        id TEXT NOT NULL REFERENCES pause_events(id) ON DELETE CASCADE,
        torrent_hash TEXT NOT NULL,
        PRIMARY KEY (id, torrent_hash)
    )",
];

pub(super) enum Backend {
    Sqlite(SqlitePool),
    /// Obligations in creation order
    Memory(parking_lot::Mutex<Vec<PauseObligation>>),
}

pub(super) enum StoreTransaction<'a> {
    Sqlite(sqlx::Transaction<'static, Sqlite>),
    Memory {
        table: &'a parking_lot::Mutex<Vec<PauseObligation>>,
        working: Vec<PauseObligation>,
    },
}

impl Backend {
    pub(super) async fn migrate(&self) -> Result<(), LedgerError> {
        if let Backend::Sqlite(pool) = self {
            for statement in SCHEMA {
                sqlx::query(statement).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub(super) async fn begin(&self) -> Result<StoreTransaction<'_>, LedgerError> {
        Ok(match self {
            Backend::Sqlite(pool) => StoreTransaction::Sqlite(pool.begin().await?),
            Backend::Memory(table) => StoreTransaction::Memory {
                working: table.lock().clone(),
                table,
            },
        })
    }
}

impl StoreTransaction<'_> {
    pub(super) async fn commit(self) -> Result<(), LedgerError> {
        match self {
            StoreTransaction::Sqlite(tx) => tx.commit().await?,
            StoreTransaction::Memory { table, working } => *table.lock() = working,
        }
        Ok(())
    }

    /// Loads every obligation in creation order.
    pub(super) async fn load_all(&mut self) -> Result<Vec<PauseObligation>, LedgerError> {
        match self {
            StoreTransaction::Sqlite(tx) => load_all(tx).await,
            StoreTransaction::Memory { working, .. } => Ok(working.clone()),
        }
    }

    pub(super) async fn insert(&mut self, obligation: &PauseObligation) -> Result<(), LedgerError> {
        match self {
            StoreTransaction::Sqlite(tx) => {
                sqlx::query("INSERT INTO pause_events (id, created_at, criteria) VALUES (?, ?, ?)")
                    .bind(&obligation.id)
                    .bind(obligation.created_at.to_rfc3339())
                    .bind(serde_json::to_string(&obligation.criteria)?)
                    .execute(&mut **tx)
                    .await?;
                add_paused(tx, &obligation.id, &obligation.paused_set).await
            }
            StoreTransaction::Memory { working, .. } => {
                working.push(obligation.clone());
                Ok(())
            }
        }
    }

    pub(super) async fn add_paused(
        &mut self,
        id: &str,
        hashes: &BTreeSet<String>,
    ) -> Result<(), LedgerError> {
        match self {
            StoreTransaction::Sqlite(tx) => add_paused(tx, id, hashes).await,
            StoreTransaction::Memory { working, .. } => {
                if let Some(obligation) = working.iter_mut().find(|o| o.id == id) {
                    obligation.paused_set.extend(hashes.iter().cloned());
                }
                Ok(())
            }
        }
    }

    /// Deletes one obligation with its paused rows; false when absent.
    pub(super) async fn delete(&mut self, id: &str) -> Result<bool, LedgerError> {
        match self {
            StoreTransaction::Sqlite(tx) => {
                let result = sqlx::query("DELETE FROM pause_events WHERE id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected() > 0)
            }
            StoreTransaction::Memory { working, .. } => {
                let before = working.len();
                working.retain(|obligation| obligation.id != id);
                Ok(working.len() < before)
            }
        }
    }

    pub(super) async fn delete_all(&mut self) -> Result<u64, LedgerError> {
        match self {
            StoreTransaction::Sqlite(tx) => {
                let result = sqlx::query("DELETE FROM pause_events")
                    .execute(&mut **tx)
                    .await?;
                Ok(result.rows_affected())
            }
            StoreTransaction::Memory { working, .. } => {
                let removed = working.len() as u64;
                working.clear();
                Ok(removed)
            }
        }
    }
}

async fn add_paused(
    conn: &mut SqliteConnection,
    id: &str,
    hashes: &BTreeSet<String>,
) -> Result<(), LedgerError> {
    for hash in hashes {
        sqlx::query("INSERT OR IGNORE INTO paused_torrents (id, torrent_hash) VALUES (?, ?)")
            .bind(id)
            .bind(hash)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn load_all(conn: &mut SqliteConnection) -> Result<Vec<PauseObligation>, LedgerError> {
    let events = sqlx::query("SELECT id, created_at, criteria FROM pause_events ORDER BY rowid")
        .fetch_all(&mut *conn)
        .await?;
    let paused_rows = sqlx::query("SELECT id, torrent_hash FROM paused_torrents")
        .fetch_all(&mut *conn)
        .await?;

    let mut paused: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in paused_rows {
        paused
            .entry(row.try_get("id")?)
            .or_default()
            .insert(row.try_get("torrent_hash")?);
    }

    events
        .into_iter()
        .map(|row| {
            let id: String = row.try_get("id")?;
            let created_at: String = row.try_get("created_at")?;
            let criteria: String = row.try_get("criteria")?;
            Ok(PauseObligation {
                paused_set: paused.remove(&id).unwrap_or_default(),
                created_at: parse_timestamp(&created_at)?,
                criteria: serde_json::from_str::<EligibilityCriteria>(&criteria)?,
                id,
            })
        })
        .collect()
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|e| LedgerError::Storage {
            reason: format!("invalid timestamp {value}: {e}"),
        })
}
