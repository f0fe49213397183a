//! Slipstream Core - reannounce racing and pause bookkeeping for a torrent client
//!
//! This crate provides the building blocks behind the server and CLI: the
//! torrent client gateway, the persistent pause ledger, the race state
//! machine, the background task registry and configuration management.

pub mod config;
pub mod gateway;
pub mod ledger;
pub mod race;
pub mod service;
pub mod tasks;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{ConfigError, ConfigFile, ConfigPaths, ConfigSource, SlipstreamConfig};
pub use gateway::{GatewayError, QbittorrentGateway, TorrentGateway};
pub use ledger::{EligibilityCriteria, LedgerError, PauseLedger, PauseObligation};
pub use race::{RaceError, RaceMachine, RaceOutcome, RaceReport, RaceSettings, RaceState};
pub use service::{DEFAULT_PAUSE_ID, PauseOverride, RaceService};
pub use tasks::{RegistryError, TaskError, TaskKind, TaskRegistry, TaskSnapshot, TaskStatus};
pub use torrent::{StatusFilter, TorrentFilter, TorrentInfo, TorrentState};

/// Errors that can bubble up from any Slipstream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Task error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Torrent client error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Race error: {0}")]
    Race(#[from] RaceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ServiceError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ServiceError::Ledger(e) => match e {
                LedgerError::DuplicateObligation { id } => {
                    format!("Torrents are already paused under [{id}], unpause it first")
                }
                LedgerError::UnknownObligation { id } => {
                    format!("Nothing is paused under [{id}]")
                }
                LedgerError::Storage { .. } => "Pause database error occurred".to_string(),
            },
            ServiceError::Registry(e) => match e {
                RegistryError::DuplicateTask { name } => {
                    format!("A task for [{name}] is already running")
                }
                RegistryError::UnknownTask { id } => format!("Task {id} not found"),
            },
            ServiceError::Gateway(e) => format!("Could not reach the torrent client: {e}"),
            ServiceError::Race(e) => match e {
                RaceError::Gateway(inner) => {
                    format!("Could not reach the torrent client: {inner}")
                }
                other => other.to_string(),
            },
            ServiceError::Config(e) => e.to_string(),
        }
    }

    /// Checks if this error was caused by the request rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Config(ConfigError::Invalid { .. })
                | ServiceError::Ledger(
                    LedgerError::DuplicateObligation { .. } | LedgerError::UnknownObligation { .. }
                )
                | ServiceError::Registry(_)
                | ServiceError::Race(
                    RaceError::TorrentNotFound { .. }
                        | RaceError::CategoryNotRaceable { .. }
                        | RaceError::TorrentPaused { .. }
                        | RaceError::AlreadyComplete { .. }
                        | RaceError::Ledger(LedgerError::DuplicateObligation { .. })
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        let duplicate = ServiceError::from(LedgerError::DuplicateObligation {
            id: "pause".to_string(),
        });
        assert!(duplicate.is_user_error());
        assert!(duplicate.user_message().contains("[pause]"));

        let storage = ServiceError::from(LedgerError::Storage {
            reason: "disk full".to_string(),
        });
        assert!(!storage.is_user_error());

        let not_found = ServiceError::from(RaceError::TorrentNotFound {
            hash: "abc".to_string(),
        });
        assert!(not_found.is_user_error());
    }
}
