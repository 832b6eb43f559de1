//! Common utilities and types shared across VaultSync crates.
//!
//! This crate provides the error taxonomy, the outcome and trigger types
//! exchanged between the sync engine and its collaborators, and the
//! validated run configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BackupSettings, Configuration, GitSettings, NotificationSettings, RemoteCredentials,
    SecretToken, SyncMode, SyncSettings, VaultSettings,
};
pub use error::{Error, Result};
pub use types::{ManualAction, RepoStatus, SyncDirection, SyncOutcome, SyncTrigger, VcsOutcome};
