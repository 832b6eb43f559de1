//! Version-control client trait definition.

use async_trait::async_trait;

use vaultsync_common::{RepoStatus, Result, VcsOutcome};

/// Capability used by the sync engine to move changes between the vault
/// and its remote.
///
/// `pull` and `push` never return errors: every failure is folded into a
/// [`VcsOutcome`] so that the engine only has to classify, never inspect.
#[async_trait]
pub trait VersionControlClient: Send + Sync {
    /// Short name used in logs (e.g., "git", "scripted").
    fn name(&self) -> &str;

    /// Make the working copy ready for sync (repository, remote, ignores).
    ///
    /// # Errors
    /// - The backing tool is unavailable
    /// - The repository cannot be initialized
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Integrate remote changes into the vault.
    async fn pull(&self) -> VcsOutcome;

    /// Record local changes and publish them to the remote.
    async fn push(&self) -> VcsOutcome;

    /// Report whether either side has changes to transfer.
    ///
    /// # Errors
    /// - The working copy cannot be inspected
    async fn status(&self) -> Result<RepoStatus>;
}
