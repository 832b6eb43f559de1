//! Common error types for VaultSync.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Top-level error type for VaultSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory settings. The daemon does not start.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Another live instance owns the vault.
    #[error("VaultSync is already running for this vault (pid {pid}, since {since})")]
    AlreadyRunning { pid: u32, since: DateTime<Utc> },

    /// Snapshot of the vault could not be taken.
    #[error("Backup failed: {0}")]
    Backup(String),

    /// Network, authentication or remote-side failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Local and remote histories cannot be combined without a human.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The lock store is unreadable or inconsistent.
    #[error("Lock store corrupted: {0}")]
    LockStore(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error must terminate the whole daemon rather than a
    /// single sync attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigInvalid(_) | Error::LockStore(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ConfigInvalid("x".into()).is_fatal());
        assert!(Error::LockStore("x".into()).is_fatal());
        assert!(!Error::Backup("x".into()).is_fatal());
        assert!(!Error::Transport("x".into()).is_fatal());
        assert!(!Error::Conflict("x".into()).is_fatal());
        assert!(!Error::AlreadyRunning {
            pid: 1,
            since: Utc::now()
        }
        .is_fatal());
    }

    #[test]
    fn test_already_running_message_names_pid() {
        let err = Error::AlreadyRunning {
            pid: 4242,
            since: Utc::now(),
        };
        assert!(err.to_string().contains("4242"));
    }
}
