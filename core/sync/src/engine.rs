//! The sync state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use vaultsync_common::{
    ManualAction, SyncDirection, SyncMode, SyncOutcome, SyncTrigger, VcsOutcome,
};
use vaultsync_vcs::VersionControlClient;

use crate::backup::BackupManager;
use crate::notify::NotificationSink;
use crate::scheduler::TriggerQueue;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Syncing,
    BackingUp,
    /// The last attempt failed. The next trigger starts from `Idle` again.
    Faulted(String),
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Syncing => write!(f, "syncing"),
            EngineState::BackingUp => write!(f, "backing up"),
            EngineState::Faulted(cause) => write!(f, "faulted ({})", cause),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Backups taken before each push.
struct BackupPolicy {
    manager: BackupManager,
    max_backups: u32,
}

/// Consumes triggers one at a time and runs the matching sync attempt.
///
/// The engine is the only caller of the version-control client and the
/// backup manager, so attempts never overlap.
pub struct SyncEngine {
    vcs: Arc<dyn VersionControlClient>,
    sink: Arc<dyn NotificationSink>,
    mode: SyncMode,
    vault: PathBuf,
    backups: Option<BackupPolicy>,
    state: EngineState,
    attempts: u64,
}

impl SyncEngine {
    pub fn new(
        vcs: Arc<dyn VersionControlClient>,
        sink: Arc<dyn NotificationSink>,
        mode: SyncMode,
        vault: impl AsRef<Path>,
    ) -> Self {
        Self {
            vcs,
            sink,
            mode,
            vault: vault.as_ref().to_path_buf(),
            backups: None,
            state: EngineState::Idle,
            attempts: 0,
        }
    }

    /// Snapshot the vault before every push, keeping at most `max_backups`
    /// records (0 keeps all).
    pub fn with_backups(mut self, manager: BackupManager, max_backups: u32) -> Self {
        self.backups = Some(BackupPolicy {
            manager,
            max_backups,
        });
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Number of pull/push attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn is_stopping(&self) -> bool {
        self.state == EngineState::Stopping
    }

    /// Unconditional pull made once when the daemon starts.
    pub async fn startup_pull(&mut self) -> SyncOutcome {
        info!(mode = %self.mode, "Initial pull");
        self.pull().await
    }

    /// Run the attempt(s) a trigger calls for and return their outcomes.
    pub async fn handle(&mut self, trigger: SyncTrigger) -> Vec<SyncOutcome> {
        match &self.state {
            EngineState::Stopping => {
                debug!(%trigger, "Engine stopping, ignoring trigger");
                return Vec::new();
            }
            EngineState::Faulted(cause) => {
                info!(%cause, "Retrying after previous failure");
                self.state = EngineState::Idle;
            }
            _ => {}
        }

        debug!(%trigger, "Handling trigger");
        match trigger {
            SyncTrigger::ProcessStarted => vec![self.pull().await],
            SyncTrigger::ProcessStopped => match self.mode {
                SyncMode::OnClose => vec![self.push_sequence().await],
                SyncMode::Interval => {
                    vec![self.skip("process stop is ignored in interval mode")]
                }
            },
            SyncTrigger::IntervalElapsed => match self.mode {
                SyncMode::Interval => vec![self.push_sequence().await],
                SyncMode::OnClose => vec![self.skip("interval tick is ignored in on_close mode")],
            },
            SyncTrigger::ManualRequest(ManualAction::Sync) => {
                info!("Manual sync requested");
                let pulled = self.pull().await;
                let pushed = self.push_sequence().await;
                vec![pulled, pushed]
            }
            SyncTrigger::ManualRequest(ManualAction::Stop) => {
                info!("Stop requested");
                self.state = EngineState::Stopping;
                Vec::new()
            }
        }
    }

    /// Consume the queue until a stop request arrives or the queue closes.
    pub async fn run(&mut self, queue: &TriggerQueue) {
        while let Some(trigger) = queue.next().await {
            self.handle(trigger).await;
            if self.is_stopping() {
                queue.close();
                break;
            }
        }
        self.state = EngineState::Stopping;
        info!(attempts = self.attempts, "Sync engine stopped");
    }

    async fn pull(&mut self) -> SyncOutcome {
        self.state = EngineState::Syncing;
        self.attempts += 1;
        let outcome = self.vcs.pull().await;
        self.finish(SyncOutcome::from_vcs(SyncDirection::Pull, outcome))
    }

    /// Backup (when enabled) followed by push. Skips both when there is
    /// nothing local to send.
    async fn push_sequence(&mut self) -> SyncOutcome {
        self.state = EngineState::Syncing;
        self.attempts += 1;

        let status = match self.vcs.status().await {
            Ok(status) => status,
            Err(e) => {
                return self.finish(SyncOutcome::TransportFailure {
                    direction: SyncDirection::Push,
                    cause: format!("could not read repository status: {}", e),
                })
            }
        };
        if !status.has_local_changes {
            debug!("No local changes, nothing to push");
            return self.finish(SyncOutcome::from_vcs(
                SyncDirection::Push,
                VcsOutcome::Success { changed: false },
            ));
        }

        if let Some(policy) = &self.backups {
            self.state = EngineState::BackingUp;
            match policy.manager.snapshot(&self.vault).await {
                Ok(record) => {
                    debug!(id = %record.id, "Backup taken before push");
                    if let Err(e) = policy.manager.prune(policy.max_backups, &record.id).await {
                        warn!(error = %e, "Could not rotate old backups");
                    }
                }
                Err(e) => {
                    return self.finish(SyncOutcome::TransportFailure {
                        direction: SyncDirection::Push,
                        cause: e.to_string(),
                    })
                }
            }
        }

        self.state = EngineState::Syncing;
        let outcome = self.vcs.push().await;
        self.finish(SyncOutcome::from_vcs(SyncDirection::Push, outcome))
    }

    fn skip(&mut self, reason: &str) -> SyncOutcome {
        self.finish(SyncOutcome::skipped(reason))
    }

    fn finish(&mut self, outcome: SyncOutcome) -> SyncOutcome {
        self.state = match &outcome {
            SyncOutcome::TransportFailure { cause, .. } => EngineState::Faulted(cause.clone()),
            _ => EngineState::Idle,
        };
        self.sink.notify(&outcome);
        outcome
    }
}
