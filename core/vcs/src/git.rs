//! Git adapter driving the `git` executable.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use vaultsync_common::{
    Configuration, Error, GitSettings, RemoteCredentials, RepoStatus, Result, VcsOutcome,
};

use crate::client::VersionControlClient;

const GITIGNORE_HEADER: &str = "# .gitignore generated by VaultSync";
const GITIGNORE_FOOTER: &str = "# End of VaultSync .gitignore";

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn mentions(&self, needle: &str) -> bool {
        self.stdout.to_lowercase().contains(needle) || self.stderr.to_lowercase().contains(needle)
    }
}

/// Version-control client backed by the `git` command line.
///
/// All commands run in the vault directory and are serialized through an
/// internal lock, so one client never runs two git processes at once.
pub struct GitClient {
    repo: PathBuf,
    branch: String,
    remote_url: String,
    credentials: RemoteCredentials,
    user_name: String,
    user_email: String,
    timeout: Duration,
    gitignore: Vec<String>,
    command_lock: Mutex<()>,
}

impl GitClient {
    /// Create a client for the repository at `repo`.
    pub fn new(
        repo: impl AsRef<Path>,
        branch: impl Into<String>,
        settings: &GitSettings,
        credentials: RemoteCredentials,
    ) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
            branch: branch.into(),
            remote_url: settings.remote_url.trim().to_string(),
            credentials,
            user_name: settings.user_name.clone(),
            user_email: settings.user_email.clone(),
            timeout: settings.timeout(),
            gitignore: settings.gitignore.clone(),
            command_lock: Mutex::new(()),
        }
    }

    /// Create a client from a validated configuration.
    pub fn from_config(config: &Configuration) -> Self {
        Self::new(
            &config.vault.path,
            config.vault.branch.clone(),
            &config.git,
            config.credentials.clone(),
        )
    }

    /// Remote URL with the token embedded, when one is configured.
    fn authenticated_url(&self) -> String {
        match &self.credentials {
            RemoteCredentials::Token(token) => embed_token(&self.remote_url, token.expose()),
            _ => self.remote_url.clone(),
        }
    }

    fn origin_ref(&self) -> String {
        format!("origin/{}", self.branch)
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput> {
        let described = args
            .iter()
            .map(|arg| strip_credentials(arg))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(command = %described, "Running git");

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.repo)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let RemoteCredentials::SshIdentity(identity) = &self.credentials {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i \"{}\" -o IdentitiesOnly=yes", identity.display()),
            );
        }

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::NotFound("git executable not found in PATH".to_string())
                } else {
                    Error::Io(e)
                }
            })?,
            Err(_) => {
                return Err(Error::Transport(format!(
                    "'git {}' timed out after {}s",
                    args.first().copied().unwrap_or_default(),
                    self.timeout.as_secs()
                )))
            }
        };

        let result = GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success {
            debug!(command = %described, stderr = %result.stderr.trim(), "git exited with failure");
        }

        Ok(result)
    }

    async fn has_commits(&self) -> Result<bool> {
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", "HEAD"])
            .await?
            .success)
    }

    async fn ref_exists(&self, reference: &str) -> Result<bool> {
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", reference])
            .await?
            .success)
    }

    async fn remote_branch_exists(&self) -> Result<bool> {
        let output = self
            .git(&["ls-remote", "--heads", "origin", &self.branch])
            .await?;
        if !output.success {
            return Err(Error::Transport(classify_failure(&output.stderr)));
        }
        Ok(!output.stdout.trim().is_empty())
    }

    async fn has_uncommitted_changes(&self) -> Result<bool> {
        let output = self.git(&["status", "--porcelain"]).await?;
        if !output.success {
            return Err(Error::Io(std::io::Error::other(format!(
                "git status failed: {}",
                output.stderr.trim()
            ))));
        }
        Ok(!output.stdout.trim().is_empty())
    }

    async fn count_commits(&self, range: &str) -> Result<u32> {
        let output = self.git(&["rev-list", "--count", range]).await?;
        Ok(output.stdout.trim().parse().unwrap_or(0))
    }

    /// Commits (ahead, behind) of the local branch relative to the last
    /// fetched remote branch.
    async fn divergence(&self) -> Result<(u32, u32)> {
        let origin = self.origin_ref();
        let local_exists = self.ref_exists(&self.branch).await?;
        let remote_exists = self.ref_exists(&origin).await?;

        match (local_exists, remote_exists) {
            (false, false) => Ok((0, 0)),
            (false, true) => Ok((0, self.count_commits(&origin).await?)),
            (true, false) => Ok((self.count_commits(&self.branch).await?, 0)),
            (true, true) => {
                let range = format!("{}...{}", self.branch, origin);
                let output = self
                    .git(&["rev-list", "--left-right", "--count", &range])
                    .await?;
                Ok(parse_ahead_behind(&output.stdout).unwrap_or((0, 0)))
            }
        }
    }

    async fn fetch(&self) -> Result<GitOutput> {
        self.git(&["fetch", "origin", &self.branch]).await
    }

    async fn restore_stash(&self) -> Result<GitOutput> {
        info!("Restoring stashed local changes");
        self.git(&["stash", "pop"]).await
    }

    /// Abort an in-progress rebase. Returns a note when the repository could
    /// not be put back.
    async fn abort_rebase(&self) -> Result<Option<String>> {
        let abort = self.git(&["rebase", "--abort"]).await?;
        Ok(cleanup_failure("abort the rebase", abort.success, &abort.stderr))
    }

    /// Pop the stash after a failed pull. Returns a note when the local
    /// changes are still stashed.
    async fn unstash_after_failure(&self) -> Result<Option<String>> {
        let pop = self.restore_stash().await?;
        Ok(cleanup_failure("restore stashed changes", pop.success, &pop.stderr))
    }

    async fn write_gitignore(&self) -> Result<()> {
        if self.gitignore.is_empty() {
            return Ok(());
        }

        let path = self.repo.join(".gitignore");
        let content = format!(
            "{}\n# Edit the git.gitignore list in the VaultSync configuration\n\n{}\n\n{}\n",
            GITIGNORE_HEADER,
            self.gitignore.join("\n"),
            GITIGNORE_FOOTER
        );

        match tokio::fs::read_to_string(&path).await {
            Ok(existing) if existing.trim() == content.trim() => {
                debug!(".gitignore already up to date");
                return Ok(());
            }
            Ok(_) => debug!("Updating managed .gitignore"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Creating managed .gitignore")
            }
            Err(e) => return Err(Error::Io(e)),
        }

        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn try_pull(&self) -> Result<VcsOutcome> {
        info!(branch = %self.branch, "Pulling changes from remote");

        if !self.remote_branch_exists().await? {
            info!("Remote branch does not exist yet, nothing to pull");
            return Ok(VcsOutcome::Success { changed: false });
        }

        let fetch = self.fetch().await?;
        if !fetch.success {
            if fetch.mentions("couldn't find remote ref") {
                return Ok(VcsOutcome::Success { changed: false });
            }
            return Ok(VcsOutcome::TransportFailure {
                cause: classify_failure(&fetch.stderr),
            });
        }

        let (ahead, behind) = self.divergence().await?;
        if behind == 0 {
            info!("Already up to date with remote");
            return Ok(VcsOutcome::Success { changed: false });
        }
        info!(behind, ahead, "Remote has new commits");

        let stashed = if self.has_uncommitted_changes().await? && self.has_commits().await? {
            let message = format!(
                "VaultSync auto-stash before pull {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            let stash = self.git(&["stash", "push", "-u", "-m", &message]).await?;
            if !stash.success {
                error!("Could not stash local changes, aborting pull");
                return Ok(VcsOutcome::TransportFailure {
                    cause: format!("could not stash local changes: {}", first_line(&stash.stderr)),
                });
            }
            true
        } else {
            false
        };

        let pull = if ahead > 0 {
            self.git(&["pull", "--rebase", "origin", &self.branch]).await?
        } else {
            self.git(&["pull", "--ff-only", "origin", &self.branch]).await?
        };

        if !pull.success {
            if pull.mentions("conflict") {
                warn!("Merge conflict during pull, aborting rebase");
                let mut notes = Vec::new();
                notes.extend(self.abort_rebase().await?);
                if stashed {
                    notes.extend(self.unstash_after_failure().await?);
                }
                return Ok(VcsOutcome::Conflict {
                    details: with_notes(
                        "remote commits conflict with local commits; resolve manually \
                         with 'git status' in the vault",
                        &notes,
                    ),
                });
            }

            let mut notes = Vec::new();
            if stashed {
                notes.extend(self.unstash_after_failure().await?);
            }
            return Ok(VcsOutcome::TransportFailure {
                cause: with_notes(&classify_failure(&pull.stderr), &notes),
            });
        }

        if stashed {
            let pop = self.restore_stash().await?;
            if !pop.success {
                if pop.mentions("conflict") || pop.mentions("merge") {
                    return Ok(VcsOutcome::Conflict {
                        details: "local edits conflict with pulled changes; resolve them, \
                                  then run 'git stash drop'"
                            .to_string(),
                    });
                }
                warn!("Could not restore stashed changes; they remain in 'git stash list'");
            }
        }

        info!("Pulled changes from remote");
        Ok(VcsOutcome::Success { changed: true })
    }

    async fn try_push(&self) -> Result<VcsOutcome> {
        info!(branch = %self.branch, "Pushing changes to remote");

        let mut committed = false;
        if self.has_uncommitted_changes().await? {
            let add = self.git(&["add", "-A"]).await?;
            if !add.success {
                return Ok(VcsOutcome::TransportFailure {
                    cause: format!("could not stage changes: {}", first_line(&add.stderr)),
                });
            }

            let message = format!(
                "VaultSync: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            let commit = self
                .git(&["-c", "commit.gpgsign=false", "commit", "-m", &message])
                .await?;
            if commit.success {
                committed = true;
            } else if !commit.mentions("nothing to commit") {
                return Ok(VcsOutcome::TransportFailure {
                    cause: format!("could not commit changes: {}", first_line(&commit.stderr)),
                });
            }
        }

        if !self.has_commits().await? {
            info!("Repository has no commits, nothing to push");
            return Ok(VcsOutcome::Success { changed: false });
        }

        let first_push = !self.remote_branch_exists().await?;
        if !first_push {
            let fetch = self.fetch().await?;
            if !fetch.success {
                return Ok(VcsOutcome::TransportFailure {
                    cause: classify_failure(&fetch.stderr),
                });
            }

            let (ahead, behind) = self.divergence().await?;
            if behind > 0 {
                warn!(behind, "Remote has newer commits, rebasing before push");
                let pull = self
                    .git(&["pull", "--rebase", "origin", &self.branch])
                    .await?;
                if !pull.success {
                    if pull.mentions("conflict") {
                        let notes: Vec<String> = self.abort_rebase().await?.into_iter().collect();
                        return Ok(VcsOutcome::Conflict {
                            details: with_notes(
                                "local commits conflict with the remote; resolve manually \
                                 and push again",
                                &notes,
                            ),
                        });
                    }
                    return Ok(VcsOutcome::TransportFailure {
                        cause: classify_failure(&pull.stderr),
                    });
                }
            } else if ahead == 0 && !committed {
                info!("No local changes to push");
                return Ok(VcsOutcome::Success { changed: false });
            }
        }

        let push = if first_push {
            info!("First push, creating remote branch");
            self.git(&["push", "-u", "origin", &self.branch]).await?
        } else {
            self.git(&["push", "origin", &self.branch]).await?
        };

        if push.success {
            info!("Pushed changes to remote");
            Ok(VcsOutcome::Success { changed: true })
        } else {
            Ok(classify_push_failure(&push.stderr))
        }
    }

    async fn try_status(&self) -> Result<RepoStatus> {
        let dirty = self.has_uncommitted_changes().await?;

        match self.fetch().await {
            Ok(output) if output.success => {}
            Ok(output) => warn!(
                cause = %classify_failure(&output.stderr),
                "Fetch failed, using last known remote state"
            ),
            Err(e) => warn!(error = %e, "Fetch failed, using last known remote state"),
        }

        let (ahead, behind) = self.divergence().await?;
        Ok(RepoStatus {
            has_remote_changes: behind > 0,
            has_local_changes: dirty || ahead > 0,
        })
    }
}

#[async_trait]
impl VersionControlClient for GitClient {
    fn name(&self) -> &str {
        "git"
    }

    async fn prepare(&self) -> Result<()> {
        let _guard = self.command_lock.lock().await;

        let version = self.git(&["--version"]).await?;
        if !version.success {
            return Err(Error::NotFound("git executable is not usable".to_string()));
        }
        debug!(version = %version.stdout.trim(), "git available");

        if !self.repo.join(".git").exists() {
            info!(path = %self.repo.display(), "Initializing git repository");
            let init = self.git(&["init"]).await?;
            if !init.success {
                return Err(Error::Io(std::io::Error::other(format!(
                    "git init failed: {}",
                    first_line(&init.stderr)
                ))));
            }
            let head = format!("refs/heads/{}", self.branch);
            if !self.git(&["symbolic-ref", "HEAD", &head]).await?.success {
                warn!(branch = %self.branch, "Could not set initial branch");
            }
        }

        self.git(&["config", "user.name", &self.user_name]).await?;
        self.git(&["config", "user.email", &self.user_email]).await?;

        let expected = self.authenticated_url();
        let current = self.git(&["remote", "get-url", "origin"]).await?;
        if !current.success {
            info!(remote = %self.remote_url, "Adding remote origin");
            let add = self.git(&["remote", "add", "origin", &expected]).await?;
            if !add.success {
                return Err(Error::InvalidInput(format!(
                    "could not add remote: {}",
                    first_line(&add.stderr)
                )));
            }
        } else if current.stdout.trim() != expected {
            info!(remote = %self.remote_url, "Updating remote origin");
            let set = self.git(&["remote", "set-url", "origin", &expected]).await?;
            if !set.success {
                return Err(Error::InvalidInput(format!(
                    "could not update remote: {}",
                    first_line(&set.stderr)
                )));
            }
        }

        self.write_gitignore().await?;
        info!("Repository ready");
        Ok(())
    }

    async fn pull(&self) -> VcsOutcome {
        let _guard = self.command_lock.lock().await;
        self.try_pull()
            .await
            .unwrap_or_else(|e| VcsOutcome::TransportFailure {
                cause: e.to_string(),
            })
    }

    async fn push(&self) -> VcsOutcome {
        let _guard = self.command_lock.lock().await;
        self.try_push()
            .await
            .unwrap_or_else(|e| VcsOutcome::TransportFailure {
                cause: e.to_string(),
            })
    }

    async fn status(&self) -> Result<RepoStatus> {
        let _guard = self.command_lock.lock().await;
        self.try_status().await
    }
}

/// Remove the userinfo part of a URL so it can be logged or compared.
pub fn strip_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// Insert a token as the userinfo of an HTTP(S) URL.
///
/// Non-HTTP URLs (SSH, local paths) are returned unchanged.
pub fn embed_token(url: &str, token: &str) -> String {
    let clean = strip_credentials(url);
    match clean.split_once("://") {
        Some((scheme, rest)) if scheme == "https" || scheme == "http" => {
            format!("{}://{}@{}", scheme, token, rest)
        }
        _ => clean,
    }
}

/// Parse `git rev-list --left-right --count` output.
fn parse_ahead_behind(output: &str) -> Option<(u32, u32)> {
    let mut parts = output.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    Some((ahead, behind))
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(strip_credentials)
        .unwrap_or_else(|| "git exited with an error".to_string())
}

/// Note for a cleanup step that failed, logged as a warning.
fn cleanup_failure(step: &str, success: bool, stderr: &str) -> Option<String> {
    if success {
        return None;
    }
    let reason = first_line(stderr);
    warn!(step, reason = %reason, "Git cleanup failed, repository needs manual attention");
    Some(format!("could not {}: {}", step, reason))
}

fn with_notes(message: &str, notes: &[String]) -> String {
    if notes.is_empty() {
        message.to_string()
    } else {
        format!("{} ({})", message, notes.join("; "))
    }
}

/// Turn git's stderr into a short human cause.
pub fn classify_failure(stderr: &str) -> String {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication")
        || lower.contains("permission denied")
        || lower.contains("could not read username")
        || lower.contains("403")
    {
        "authentication failed; check the remote token or SSH identity".to_string()
    } else if lower.contains("repository not found") || lower.contains("does not appear to be a git repository") {
        "remote repository not found; check git.remote_url".to_string()
    } else if lower.contains("could not resolve host")
        || lower.contains("unable to access")
        || lower.contains("timed out")
        || lower.contains("connection")
    {
        format!("network unreachable: {}", first_line(stderr))
    } else {
        first_line(stderr)
    }
}

/// Classify a failed `git push`.
pub fn classify_push_failure(stderr: &str) -> VcsOutcome {
    let lower = stderr.to_lowercase();
    if lower.contains("rejected") || lower.contains("non-fast-forward") || lower.contains("fetch first") {
        VcsOutcome::Conflict {
            details: "push rejected because the remote has diverged; pull first".to_string(),
        }
    } else {
        VcsOutcome::TransportFailure {
            cause: classify_failure(stderr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vaultsync_common::SecretToken;

    #[test]
    fn test_strip_credentials() {
        assert_eq!(
            strip_credentials("https://tok@github.com/a/b.git"),
            "https://github.com/a/b.git"
        );
        assert_eq!(
            strip_credentials("https://user:pw@host/a@b"),
            "https://host/a@b"
        );
        assert_eq!(
            strip_credentials("git@github.com:a/b.git"),
            "git@github.com:a/b.git"
        );
        assert_eq!(strip_credentials("/srv/remote.git"), "/srv/remote.git");
    }

    #[test]
    fn test_embed_token_only_for_http() {
        assert_eq!(
            embed_token("https://github.com/a/b.git", "t0k"),
            "https://t0k@github.com/a/b.git"
        );
        assert_eq!(
            embed_token("https://old@github.com/a/b.git", "new"),
            "https://new@github.com/a/b.git"
        );
        assert_eq!(
            embed_token("git@github.com:a/b.git", "t0k"),
            "git@github.com:a/b.git"
        );
    }

    #[test]
    fn test_parse_ahead_behind() {
        assert_eq!(parse_ahead_behind("3\t5\n"), Some((3, 5)));
        assert_eq!(parse_ahead_behind("0 0"), Some((0, 0)));
        assert_eq!(parse_ahead_behind(""), None);
        assert_eq!(parse_ahead_behind("x y"), None);
    }

    #[test]
    fn test_classify_failure() {
        assert!(classify_failure("fatal: Authentication failed for 'https://x@h/r'")
            .starts_with("authentication"));
        assert!(classify_failure("remote: Repository not found.").contains("not found"));
        assert!(classify_failure("fatal: unable to access 'https://h/': Could not resolve host: h")
            .starts_with("network"));
        assert_eq!(classify_failure("\n  weird failure\nmore"), "weird failure");
        assert_eq!(classify_failure(""), "git exited with an error");
    }

    #[test]
    fn test_failed_cleanup_is_reported_in_outcome() {
        assert_eq!(cleanup_failure("abort the rebase", true, ""), None);

        let note = cleanup_failure(
            "restore stashed changes",
            false,
            "error: could not restore untracked files from stash\n",
        )
        .unwrap();
        assert_eq!(
            note,
            "could not restore stashed changes: error: could not restore untracked files from stash"
        );

        assert_eq!(with_notes("pull failed", &[]), "pull failed");
        assert_eq!(
            with_notes("pull failed", &[note.clone(), "could not abort the rebase: x".into()]),
            format!("pull failed ({}; could not abort the rebase: x)", note)
        );
    }

    #[test]
    fn test_classified_causes_never_leak_tokens() {
        let cause = classify_failure("fatal: something odd at https://secret@github.com/a/b.git");
        assert!(!cause.contains("secret"));
    }

    #[test]
    fn test_push_rejection_is_conflict() {
        let outcome = classify_push_failure(
            " ! [rejected]        main -> main (fetch first)\nerror: failed to push some refs",
        );
        assert!(matches!(outcome, VcsOutcome::Conflict { .. }));

        let outcome = classify_push_failure("fatal: Authentication failed");
        assert!(matches!(outcome, VcsOutcome::TransportFailure { .. }));
    }

    #[test]
    fn test_authenticated_url_uses_token() {
        let mut settings = GitSettings::default();
        settings.remote_url = "https://github.com/a/b.git".to_string();
        let client = GitClient::new(
            "/tmp/vault",
            "main",
            &settings,
            RemoteCredentials::Token(SecretToken::new("abc")),
        );
        assert_eq!(client.authenticated_url(), "https://abc@github.com/a/b.git");

        let client = GitClient::new("/tmp/vault", "main", &settings, RemoteCredentials::Ambient);
        assert_eq!(client.authenticated_url(), "https://github.com/a/b.git");
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn local_client(vault: &Path, remote: &Path) -> GitClient {
        let settings = GitSettings {
            user_name: "VaultSync Test".to_string(),
            user_email: "test@example.com".to_string(),
            timeout_secs: 60,
            remote_url: remote.display().to_string(),
            ssh_identity: None,
            gitignore: Vec::new(),
        };
        GitClient::new(vault, "main", &settings, RemoteCredentials::Ambient)
    }

    fn init_bare(path: &Path) {
        let status = std::process::Command::new("git")
            .args(["init", "--bare", "--quiet"])
            .arg(path)
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_push_then_pull_between_two_vaults() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let remote = temp.path().join("remote.git");
        let vault_a = temp.path().join("a");
        let vault_b = temp.path().join("b");
        init_bare(&remote);
        std::fs::create_dir(&vault_a).unwrap();
        std::fs::create_dir(&vault_b).unwrap();

        let a = local_client(&vault_a, &remote);
        a.prepare().await.unwrap();

        // Nothing committed yet.
        assert_eq!(a.push().await, VcsOutcome::Success { changed: false });

        std::fs::write(vault_a.join("note.md"), "# hello\n").unwrap();
        let status = a.status().await.unwrap();
        assert!(status.has_local_changes);
        assert_eq!(a.push().await, VcsOutcome::Success { changed: true });
        assert_eq!(a.push().await, VcsOutcome::Success { changed: false });
        assert!(!a.status().await.unwrap().has_local_changes);

        let b = local_client(&vault_b, &remote);
        b.prepare().await.unwrap();
        assert!(b.status().await.unwrap().has_remote_changes);
        assert_eq!(b.pull().await, VcsOutcome::Success { changed: true });
        assert_eq!(
            std::fs::read_to_string(vault_b.join("note.md")).unwrap(),
            "# hello\n"
        );
        assert_eq!(b.pull().await, VcsOutcome::Success { changed: false });
    }

    #[tokio::test]
    async fn test_divergent_edits_report_conflict() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let remote = temp.path().join("remote.git");
        let vault_a = temp.path().join("a");
        let vault_b = temp.path().join("b");
        init_bare(&remote);
        std::fs::create_dir(&vault_a).unwrap();
        std::fs::create_dir(&vault_b).unwrap();

        let a = local_client(&vault_a, &remote);
        a.prepare().await.unwrap();
        std::fs::write(vault_a.join("note.md"), "base\n").unwrap();
        assert_eq!(a.push().await, VcsOutcome::Success { changed: true });

        let b = local_client(&vault_b, &remote);
        b.prepare().await.unwrap();
        assert_eq!(b.pull().await, VcsOutcome::Success { changed: true });

        std::fs::write(vault_a.join("note.md"), "edited on a\n").unwrap();
        assert_eq!(a.push().await, VcsOutcome::Success { changed: true });

        std::fs::write(vault_b.join("note.md"), "edited on b\n").unwrap();
        let outcome = b.push().await;
        assert!(matches!(outcome, VcsOutcome::Conflict { .. }), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_prepare_writes_managed_gitignore_once() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let remote = temp.path().join("remote.git");
        let vault = temp.path().join("vault");
        init_bare(&remote);
        std::fs::create_dir(&vault).unwrap();

        let settings = GitSettings {
            user_name: "VaultSync Test".to_string(),
            user_email: "test@example.com".to_string(),
            remote_url: remote.display().to_string(),
            ..GitSettings::default()
        };
        let client = GitClient::new(&vault, "main", &settings, RemoteCredentials::Ambient);
        client.prepare().await.unwrap();

        let content = std::fs::read_to_string(vault.join(".gitignore")).unwrap();
        assert!(content.starts_with(GITIGNORE_HEADER));
        assert!(content.contains(".obsidian/workspace.json"));

        client.prepare().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(vault.join(".gitignore")).unwrap(),
            content
        );
    }
}
