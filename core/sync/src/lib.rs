//! VaultSync daemon core
//!
//! This crate provides everything the daemon runs on, including:
//! - The sync engine state machine and its trigger queue
//! - Crash-safe vault backups with rotation
//! - Single-instance locking per vault
//! - Process watching and outcome notifications

pub mod backup;
pub mod daemon;
pub mod engine;
pub mod guard;
pub mod notify;
pub mod scheduler;
pub mod watcher;

// Re-export main types
pub use backup::{BackupManager, BackupRecord};
pub use daemon::Daemon;
pub use engine::{EngineState, SyncEngine};
pub use guard::{ControlMarkers, InstanceGuard, InstanceLock, InstanceStatus, LockRecord};
pub use notify::{DaemonEvent, DesktopNotifier, FanOut, LogSink, MemorySink, NotificationSink};
pub use scheduler::TriggerQueue;
pub use watcher::{ProcessTable, ProcessWatcher, SystemProcessTable};
