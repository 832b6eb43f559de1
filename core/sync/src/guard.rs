//! One daemon per vault: persisted lock records, stale-owner reclaim and
//! control markers.

use blake2::{Blake2s256, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vaultsync_common::{Error, ManualAction, Result};

use crate::watcher::{ProcessTable, SystemProcessTable};

const ACQUIRE_ATTEMPTS: usize = 3;

/// What the lock file holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub vault_path: PathBuf,
    pub pid: u32,
    /// Start time of the owning process, used to tell a live owner from a
    /// recycled pid.
    pub started_at: Option<u64>,
    pub hostname: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

/// Result of [`InstanceGuard::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running { pid: u32, since: DateTime<Utc> },
    NotRunning,
}

/// Paths of one vault's lock and marker files.
#[derive(Debug, Clone)]
struct LockPaths {
    lock: PathBuf,
    stop: PathBuf,
    sync: PathBuf,
}

impl LockPaths {
    fn new(lock_dir: &Path, key: &str) -> Self {
        Self {
            lock: lock_dir.join(format!("{}.lock", key)),
            stop: lock_dir.join(format!("{}.stop", key)),
            sync: lock_dir.join(format!("{}.sync", key)),
        }
    }
}

/// Control requests left for the running daemon by other invocations.
#[derive(Debug, Clone)]
pub struct ControlMarkers {
    stop: PathBuf,
    sync: PathBuf,
}

impl ControlMarkers {
    /// Consume pending requests. Stop comes first when both are present.
    pub fn take(&self) -> Vec<ManualAction> {
        let mut actions = Vec::new();
        if take_marker(&self.stop) {
            actions.push(ManualAction::Stop);
        }
        if take_marker(&self.sync) {
            actions.push(ManualAction::Sync);
        }
        actions
    }

    fn clear(&self) {
        let _ = fs::remove_file(&self.stop);
        let _ = fs::remove_file(&self.sync);
    }
}

fn take_marker(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not consume control marker");
            false
        }
    }
}

/// Exclusive ownership of a vault. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    record: LockRecord,
    markers: ControlMarkers,
    released: bool,
}

impl InstanceLock {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn markers(&self) -> ControlMarkers {
        self.markers.clone()
    }

    /// Remove the lock file if it is still ours. Safe to call repeatedly.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match read_record(&self.path) {
            Ok(Some(current)) if current == self.record => {
                fs::remove_file(&self.path)?;
                self.markers.clear();
                info!(vault = %self.record.vault_path.display(), "Instance lock released");
            }
            Ok(Some(_)) => warn!("Lock file now belongs to another owner, leaving it"),
            Ok(None) => debug!("Lock file already gone"),
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release instance lock");
        }
    }
}

/// Grants at most one live [`InstanceLock`] per vault path.
#[derive(Clone)]
pub struct InstanceGuard {
    lock_dir: PathBuf,
    processes: Arc<dyn ProcessTable>,
}

impl InstanceGuard {
    /// Guard storing its records under `<state_dir>/locks`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self::with_process_table(state_dir, Arc::new(SystemProcessTable::new()))
    }

    pub fn with_process_table(state_dir: impl AsRef<Path>, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            lock_dir: state_dir.as_ref().join("locks"),
            processes,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn paths(&self, vault: &Path) -> LockPaths {
        LockPaths::new(&self.lock_dir, &lock_key(vault))
    }

    /// Take exclusive ownership of `vault` for this process.
    ///
    /// A lock left by a process that no longer exists is reclaimed.
    pub fn acquire(&self, vault: impl AsRef<Path>) -> Result<InstanceLock> {
        let vault = canonical(vault.as_ref());
        let paths = self.paths(&vault);
        fs::create_dir_all(&self.lock_dir).map_err(|e| {
            Error::LockStore(format!(
                "cannot create lock directory {}: {}",
                self.lock_dir.display(),
                e
            ))
        })?;

        let pid = std::process::id();
        let record = LockRecord {
            vault_path: vault.clone(),
            pid,
            started_at: self.processes.start_time(pid),
            hostname: System::host_name(),
            acquired_at: Utc::now(),
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            if publish(&paths.lock, &record)? {
                let markers = ControlMarkers {
                    stop: paths.stop.clone(),
                    sync: paths.sync.clone(),
                };
                markers.clear();
                info!(vault = %vault.display(), pid, "Instance lock acquired");
                return Ok(InstanceLock {
                    path: paths.lock,
                    record,
                    markers,
                    released: false,
                });
            }

            let Some(existing) = read_record(&paths.lock)? else {
                continue;
            };

            if self.is_alive(&existing) {
                return Err(Error::AlreadyRunning {
                    pid: existing.pid,
                    since: existing.acquired_at,
                });
            }

            warn!(
                pid = existing.pid,
                since = %existing.acquired_at,
                "Reclaiming lock of a process that exited without releasing it"
            );
            reclaim(&paths.lock, &existing)?;
        }

        Err(Error::LockStore(format!(
            "lock {} kept changing while acquiring",
            paths.lock.display()
        )))
    }

    /// Whether a live daemon owns `vault`.
    pub fn status(&self, vault: impl AsRef<Path>) -> Result<InstanceStatus> {
        let paths = self.paths(&canonical(vault.as_ref()));
        match read_record(&paths.lock)? {
            Some(record) if self.is_alive(&record) => Ok(InstanceStatus::Running {
                pid: record.pid,
                since: record.acquired_at,
            }),
            Some(record) => {
                debug!(pid = record.pid, "Lock record is stale");
                Ok(InstanceStatus::NotRunning)
            }
            None => Ok(InstanceStatus::NotRunning),
        }
    }

    /// Ask the owning daemon to stop after its current attempt.
    ///
    /// Returns the owner's pid, or `None` when nothing is running.
    pub fn request_stop(&self, vault: impl AsRef<Path>) -> Result<Option<u32>> {
        self.request(vault.as_ref(), ManualAction::Stop)
    }

    /// Ask the owning daemon to run one manual sync.
    pub fn request_sync(&self, vault: impl AsRef<Path>) -> Result<Option<u32>> {
        self.request(vault.as_ref(), ManualAction::Sync)
    }

    fn request(&self, vault: &Path, action: ManualAction) -> Result<Option<u32>> {
        let InstanceStatus::Running { pid, .. } = self.status(vault)? else {
            return Ok(None);
        };
        let paths = self.paths(&canonical(vault));
        let marker = match action {
            ManualAction::Stop => paths.stop,
            ManualAction::Sync => paths.sync,
        };
        fs::write(&marker, Utc::now().to_rfc3339())?;
        info!(pid, ?action, "Request sent to running instance");
        Ok(Some(pid))
    }

    fn is_alive(&self, record: &LockRecord) -> bool {
        if let (Some(theirs), Some(ours)) = (&record.hostname, System::host_name()) {
            if *theirs != ours {
                // Cannot inspect another machine's processes.
                return true;
            }
        }
        match (self.processes.start_time(record.pid), record.started_at) {
            (None, _) => false,
            (Some(now), Some(recorded)) => now == recorded,
            (Some(_), None) => true,
        }
    }
}

/// Stable file-name key for a vault path.
pub fn lock_key(vault: &Path) -> String {
    let digest = Blake2s256::digest(vault.to_string_lossy().as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

fn canonical(vault: &Path) -> PathBuf {
    fs::canonicalize(vault).unwrap_or_else(|_| {
        if vault.is_absolute() {
            vault.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(vault))
                .unwrap_or_else(|_| vault.to_path_buf())
        }
    })
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::LockStore(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| Error::LockStore(format!("{} is unreadable: {}", path.display(), e)))
}

/// Write the record to a private file and link it to the lock name.
/// Returns `false` when a lock already exists.
fn publish(lock: &Path, record: &LockRecord) -> Result<bool> {
    let temp = lock.with_extension(format!("{}.tmp", Uuid::new_v4()));
    let result = (|| -> io::Result<bool> {
        let mut file = fs::File::create(&temp)?;
        file.write_all(&serde_json::to_vec_pretty(record).map_err(io::Error::other)?)?;
        file.sync_all()?;
        match fs::hard_link(&temp, lock) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    })();
    let _ = fs::remove_file(&temp);
    result.map_err(|e| Error::LockStore(format!("cannot write {}: {}", lock.display(), e)))
}

/// Move a stale lock out of the way, putting it back if it turned out to
/// be a different record than the one judged stale.
fn reclaim(lock: &Path, stale: &LockRecord) -> Result<()> {
    let tomb = lock.with_extension(format!("stale-{}", Uuid::new_v4()));
    match fs::rename(lock, &tomb) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::LockStore(format!("cannot reclaim lock: {}", e))),
    }

    let moved = read_record(&tomb)?;
    if moved.as_ref() != Some(stale) {
        debug!("Lock changed owner during reclaim, restoring it");
        restore_moved(&tomb, lock)?;
    }
    if let Err(e) = fs::remove_file(&tomb) {
        debug!(error = %e, "Could not remove reclaimed lock");
    }
    Ok(())
}

/// Put a lock moved aside by `reclaim` back in place. On failure the moved
/// record is left at `tomb` and the lock is reported lost.
fn restore_moved(tomb: &Path, lock: &Path) -> Result<()> {
    fs::hard_link(tomb, lock).map_err(|e| {
        error!(
            lock = %lock.display(),
            moved = %tomb.display(),
            error = %e,
            "Could not restore a live lock moved during reclaim"
        );
        Error::LockStore(format!(
            "lock {} of another instance was displaced and could not be restored: {}",
            lock.display(),
            e
        ))
    })
}
