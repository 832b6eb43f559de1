//! Timestamped vault snapshots with crash-safe publication and rotation.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultsync_common::{Error, Result};

/// Prefix of every published snapshot directory.
pub const BACKUP_PREFIX: &str = "vault_backup_";
/// Manifest written inside each snapshot. Its presence marks a complete record.
pub const MANIFEST_NAME: &str = ".backup.json";
const PARTIAL_PREFIX: &str = ".partial-";

/// A complete snapshot of the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Directory name, also used as the identifier.
    pub id: String,
    pub vault_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub file_count: u64,
    /// Location on disk. Not part of the manifest.
    #[serde(skip)]
    pub path: PathBuf,
}

/// Totals gathered while copying a tree.
#[derive(Debug, Default, Clone, Copy)]
struct CopyStats {
    files: u64,
    bytes: u64,
}

/// Whether an entry of the vault is left out of snapshots.
pub fn is_excluded(name: &str) -> bool {
    name.starts_with(".git")
        || matches!(name, ".DS_Store" | "Thumbs.db" | "desktop.ini" | ".trash")
        || name.ends_with(".tmp")
        || name.ends_with(".swp")
        || name.ends_with('~')
}

/// Manages the backup directory.
///
/// The directory itself is the persisted index: records are discovered by
/// scanning for snapshot directories carrying a valid manifest.
#[derive(Debug, Clone)]
pub struct BackupManager {
    directory: PathBuf,
}

impl BackupManager {
    /// Open (creating if needed) a backup directory and clear out
    /// work-in-progress left behind by an interrupted snapshot.
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).await.map_err(|e| {
            Error::Backup(format!(
                "cannot create backup directory {}: {}",
                directory.display(),
                e
            ))
        })?;

        let mut entries = fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(PARTIAL_PREFIX) {
                warn!(path = %entry.path().display(), "Removing interrupted backup");
                fs::remove_dir_all(entry.path()).await?;
            }
        }

        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Copy the vault into a new timestamped snapshot.
    ///
    /// The copy is built under a hidden partial name and only renamed into
    /// place once the manifest is written, so an interrupted snapshot is
    /// never listed.
    pub async fn snapshot(&self, vault: impl AsRef<Path>) -> Result<BackupRecord> {
        let vault = vault.as_ref();
        let metadata = fs::metadata(vault).await.map_err(|e| {
            Error::Backup(format!("vault {} is not readable: {}", vault.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Backup(format!(
                "vault {} is not a directory",
                vault.display()
            )));
        }

        let partial = self
            .directory
            .join(format!("{}{}", PARTIAL_PREFIX, Uuid::new_v4()));

        match self.build_snapshot(vault, &partial).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&partial).await {
                    debug!(error = %cleanup, "Could not remove partial backup");
                }
                Err(match e {
                    Error::Backup(msg) => Error::Backup(msg),
                    other => Error::Backup(other.to_string()),
                })
            }
        }
    }

    async fn build_snapshot(&self, vault: &Path, partial: &Path) -> Result<BackupRecord> {
        let created_at = Utc::now();
        info!(vault = %vault.display(), "Creating backup");

        let stats = copy_tree(vault, partial, true).await?;

        let stamp = created_at
            .with_timezone(&Local)
            .format("%Y%m%d_%H%M%S_%3f")
            .to_string();
        let (id, target) = self.unused_name(&stamp).await;

        let mut record = BackupRecord {
            id,
            vault_path: vault.to_path_buf(),
            created_at,
            size_bytes: stats.bytes,
            file_count: stats.files,
            path: target.clone(),
        };

        let manifest = serde_json::to_vec_pretty(&record)?;
        fs::write(partial.join(MANIFEST_NAME), manifest).await?;
        fs::rename(partial, &target).await?;
        record.path = target;

        info!(
            id = %record.id,
            files = record.file_count,
            bytes = record.size_bytes,
            "Backup created"
        );
        Ok(record)
    }

    async fn unused_name(&self, stamp: &str) -> (String, PathBuf) {
        let base = format!("{}{}", BACKUP_PREFIX, stamp);
        let mut id = base.clone();
        let mut counter = 1u32;
        while fs::symlink_metadata(self.directory.join(&id)).await.is_ok() {
            id = format!("{}_{}", base, counter);
            counter += 1;
        }
        let path = self.directory.join(&id);
        (id, path)
    }

    /// All complete records, newest first.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(Error::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(BACKUP_PREFIX) {
                continue;
            }
            match read_manifest(&entry.path()).await {
                Some(mut record) => {
                    record.id = name;
                    record.path = entry.path();
                    records.push(record);
                }
                None => debug!(name = %name, "Ignoring backup without a valid manifest"),
            }
        }

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }

    /// Look up one record by id.
    pub async fn get(&self, id: &str) -> Result<BackupRecord> {
        self.list()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("backup {}", id)))
    }

    /// Delete the oldest records until at most `max_count` remain.
    ///
    /// A `max_count` of zero means unbounded and prunes nothing. The record
    /// named by `keep` is never removed, wherever its timestamp sorts.
    /// Returns the removed records.
    pub async fn prune(&self, max_count: u32, keep: &str) -> Result<Vec<BackupRecord>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let records = self.list().await?;
        let kept = records.iter().any(|r| r.id == keep);
        let allowance = (max_count as usize).saturating_sub(usize::from(kept));

        let mut removed = Vec::new();
        for record in records
            .into_iter()
            .filter(|r| r.id != keep)
            .skip(allowance)
        {
            fs::remove_dir_all(&record.path).await?;
            info!(id = %record.id, "Removed old backup");
            removed.push(record);
        }
        Ok(removed)
    }

    /// Delete one record.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let record = self.get(id).await?;
        fs::remove_dir_all(&record.path).await?;
        info!(id = %id, "Removed backup");
        Ok(())
    }

    /// Copy a snapshot into `target`, which must be missing or empty.
    pub async fn restore(&self, id: &str, target: impl AsRef<Path>) -> Result<BackupRecord> {
        let target = target.as_ref();
        let record = self.get(id).await?;

        match fs::read_dir(target).await {
            Ok(mut entries) => {
                if entries.next_entry().await?.is_some() {
                    return Err(Error::InvalidInput(format!(
                        "restore target {} is not empty",
                        target.display()
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let stats = copy_tree(&record.path, target, false).await?;
        info!(id = %id, target = %target.display(), files = stats.files, "Backup restored");
        Ok(record)
    }
}

async fn read_manifest(dir: &Path) -> Option<BackupRecord> {
    let content = fs::read(dir.join(MANIFEST_NAME)).await.ok()?;
    serde_json::from_slice(&content).ok()
}

/// Copy `source` into `dest`. Symlinks are skipped. When `filter` is set,
/// excluded names are skipped at every level; otherwise only the manifest
/// at the root is left behind.
async fn copy_tree(source: &Path, dest: &Path, filter: bool) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let at_root = from == source;

        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if filter && is_excluded(&name_str) {
                continue;
            }
            if !filter && at_root && name_str == MANIFEST_NAME {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symlink");
            } else if file_type.is_dir() {
                pending.push((entry.path(), to.join(&name)));
            } else if file_type.is_file() {
                stats.bytes += fs::copy(entry.path(), to.join(&name)).await?;
                stats.files += 1;
            }
        }
    }

    Ok(stats)
}
