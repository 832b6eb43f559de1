//! Run configuration and its TOML representation.
//!
//! A [`Configuration`] is immutable for the lifetime of a daemon run. It is
//! loaded from a TOML file, completed with remote credentials taken from the
//! environment, and checked with [`Configuration::validate`] before any
//! component is constructed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Environment variables consulted for the remote token, in order.
pub const TOKEN_ENV_VARS: [&str; 2] = ["VAULTSYNC_TOKEN", "GITHUB_TOKEN"];

/// When push attempts are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Push when the watched application exits.
    #[default]
    OnClose,
    /// Push on a fixed timer.
    Interval,
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_close" | "on-close" | "onclose" => Ok(SyncMode::OnClose),
            "interval" => Ok(SyncMode::Interval),
            other => Err(Error::InvalidInput(format!(
                "unknown sync mode '{}', expected 'on_close' or 'interval'",
                other
            ))),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::OnClose => write!(f, "on_close"),
            SyncMode::Interval => write!(f, "interval"),
        }
    }
}

/// Location of the synchronized directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    pub path: PathBuf,
    pub branch: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            branch: "main".to_string(),
        }
    }
}

/// Longest accepted push interval: one week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Trigger policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub mode: SyncMode,
    /// Push interval in minutes. Only read in interval mode.
    pub interval_minutes: u64,
    /// Name of the foreground application process to watch.
    pub process_name: String,
    /// How often the process table is sampled.
    pub poll_interval_secs: u64,
    /// Minimum spacing between two honoured process-start triggers.
    pub debounce_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::OnClose,
            interval_minutes: 30,
            process_name: default_process_name().to_string(),
            poll_interval_secs: 3,
            debounce_secs: 10,
        }
    }
}

impl SyncSettings {
    /// Push interval, present only in interval mode.
    pub fn interval(&self) -> Option<Duration> {
        match self.mode {
            SyncMode::Interval => Some(Duration::from_secs(
                self.interval_minutes.saturating_mul(60),
            )),
            SyncMode::OnClose => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

fn default_process_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "Obsidian.exe"
    } else if cfg!(target_os = "macos") {
        "Obsidian"
    } else {
        "obsidian"
    }
}

/// Pre-push snapshot policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Number of snapshots kept after rotation. Zero keeps everything.
    pub max_backups: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::new(),
            max_backups: 10,
        }
    }
}

/// Desktop notification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub min_interval_secs: u64,
    pub duplicate_window_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: 5,
            duplicate_window_secs: 30,
        }
    }
}

/// Repository and remote settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub user_name: String,
    pub user_email: String,
    /// Upper bound for a single git command.
    pub timeout_secs: u64,
    /// Remote URL without credentials.
    pub remote_url: String,
    pub ssh_identity: Option<PathBuf>,
    /// Patterns written to the managed `.gitignore`.
    pub gitignore: Vec<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            user_name: String::new(),
            user_email: String::new(),
            timeout_secs: 300,
            remote_url: String::new(),
            ssh_identity: None,
            gitignore: vec![
                ".obsidian/workspace.json".to_string(),
                ".obsidian/workspace-mobile.json".to_string(),
                ".trash/".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
            ],
        }
    }
}

impl GitSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Access token that is wiped from memory on drop and never printed.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Expose the raw token. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretToken([REDACTED])")
    }
}

/// Credentials handed to the version-control client. Opaque to the engine.
#[derive(Debug, Clone, Default)]
pub enum RemoteCredentials {
    /// HTTPS token embedded into the remote URL.
    Token(SecretToken),
    /// SSH private key passed through `GIT_SSH_COMMAND`.
    SshIdentity(PathBuf),
    /// Whatever git's own credential helpers provide.
    #[default]
    Ambient,
}

impl RemoteCredentials {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteCredentials::Token(_) => "token",
            RemoteCredentials::SshIdentity(_) => "ssh identity",
            RemoteCredentials::Ambient => "ambient",
        }
    }
}

/// Validated, immutable configuration for one daemon run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Where lock records and control markers live.
    pub state_dir: Option<PathBuf>,
    pub vault: VaultSettings,
    pub sync: SyncSettings,
    pub backup: BackupSettings,
    pub notification: NotificationSettings,
    pub git: GitSettings,
    #[serde(skip)]
    pub credentials: RemoteCredentials,
}

impl Configuration {
    /// Default configuration file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vaultsync").join("config.toml"))
    }

    /// Load a configuration file and resolve credentials from the environment.
    ///
    /// The result is not validated; call [`Configuration::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        let token = TOKEN_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
        config.credentials = Self::resolve_credentials(&config.git, token);
        Ok(config)
    }

    /// Parse a configuration from TOML text without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigInvalid(e.to_string()))
    }

    /// Pick the credential handle for the remote.
    ///
    /// An explicit SSH identity wins over a token from the environment.
    pub fn resolve_credentials(git: &GitSettings, token: Option<String>) -> RemoteCredentials {
        if let Some(identity) = &git.ssh_identity {
            return RemoteCredentials::SshIdentity(identity.clone());
        }
        match token {
            Some(token) => RemoteCredentials::Token(SecretToken::new(token.trim())),
            None => RemoteCredentials::Ambient,
        }
    }

    /// Check completeness and consistency, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigInvalid(problems.join("; ")))
        }
    }

    /// List all configuration problems.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.vault.path.as_os_str().is_empty() {
            problems.push("vault.path is not set".to_string());
        } else if !self.vault.path.is_dir() {
            problems.push(format!(
                "vault.path does not exist or is not a directory: {}",
                self.vault.path.display()
            ));
        }
        if self.vault.branch.trim().is_empty() {
            problems.push("vault.branch is empty".to_string());
        }

        if self.sync.process_name.trim().is_empty() {
            problems.push("sync.process_name is empty".to_string());
        }
        if self.sync.poll_interval_secs == 0 {
            problems.push("sync.poll_interval_secs must be at least 1".to_string());
        }
        if self.sync.mode == SyncMode::Interval {
            if self.sync.interval_minutes < 1 {
                problems
                    .push("sync.interval_minutes must be at least 1 in interval mode".to_string());
            } else if self.sync.interval_minutes > MAX_INTERVAL_MINUTES {
                problems.push(format!(
                    "sync.interval_minutes must be at most {} (one week)",
                    MAX_INTERVAL_MINUTES
                ));
            }
        }

        if self.backup.enabled {
            if self.backup.directory.as_os_str().is_empty() {
                problems.push("backup.directory must be set when backups are enabled".to_string());
            } else if !self.vault.path.as_os_str().is_empty()
                && self.backup.directory.starts_with(&self.vault.path)
            {
                problems.push("backup.directory must not be inside the vault".to_string());
            }
        }

        if self.git.remote_url.trim().is_empty() {
            problems.push("git.remote_url is not set".to_string());
        }
        if self.git.user_name.trim().is_empty() {
            problems.push("git.user_name is not set".to_string());
        }
        if self.git.user_email.trim().is_empty() {
            problems.push("git.user_email is not set".to_string());
        }
        if self.git.timeout_secs == 0 {
            problems.push("git.timeout_secs must be positive".to_string());
        }

        problems
    }

    /// Directory holding lock records and control markers.
    pub fn resolved_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|dir| dir.join("vaultsync"))
            .ok_or_else(|| {
                Error::ConfigInvalid("no state_dir set and no local data directory found".into())
            })
    }

    /// Render the effective configuration as TOML. Credentials are never included.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// A commented starter file.
    pub fn template() -> String {
        format!(
            r#"# VaultSync configuration.
# The remote token is read from ${token_var} (or ${fallback_var}), never from this file.

[vault]
path = ""
branch = "main"

[sync]
# "on_close": pull when the editor starts, push when it exits.
# "interval": pull when the editor starts, push every interval_minutes.
mode = "on_close"
interval_minutes = 30
process_name = "{process}"
poll_interval_secs = 3
debounce_secs = 10

[backup]
enabled = true
directory = ""
# 0 keeps every snapshot.
max_backups = 10

[notification]
enabled = true
min_interval_secs = 5
duplicate_window_secs = 30

[git]
user_name = ""
user_email = ""
timeout_secs = 300
remote_url = ""
# ssh_identity = "~/.ssh/id_ed25519"
gitignore = [
    ".obsidian/workspace.json",
    ".obsidian/workspace-mobile.json",
    ".trash/",
    ".DS_Store",
    "Thumbs.db",
]
"#,
            token_var = TOKEN_ENV_VARS[0],
            fallback_var = TOKEN_ENV_VARS[1],
            process = default_process_name(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn complete_config(vault: &Path, backups: &Path) -> Configuration {
        let mut config = Configuration::default();
        config.vault.path = vault.to_path_buf();
        config.backup.directory = backups.to_path_buf();
        config.git.remote_url = "https://github.com/someone/notes.git".to_string();
        config.git.user_name = "someone".to_string();
        config.git.user_email = "someone@example.com".to_string();
        config
    }

    #[test]
    fn test_complete_config_validates() {
        let temp = TempDir::new().unwrap();
        let vault = temp.path().join("vault");
        std::fs::create_dir(&vault).unwrap();
        let config = complete_config(&vault, &temp.path().join("backups"));
        config.validate().unwrap();
    }

    #[test]
    fn test_all_problems_reported_together() {
        let config = Configuration::default();
        let problems = config.problems();
        assert!(problems.iter().any(|p| p.contains("vault.path")));
        assert!(problems.iter().any(|p| p.contains("backup.directory")));
        assert!(problems.iter().any(|p| p.contains("git.remote_url")));
        assert!(problems.iter().any(|p| p.contains("git.user_name")));
        assert!(problems.iter().any(|p| p.contains("git.user_email")));

        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_interval_mode_requires_positive_interval() {
        let temp = TempDir::new().unwrap();
        let mut config = complete_config(temp.path(), &temp.path().with_extension("bak"));
        config.sync.mode = SyncMode::Interval;
        config.sync.interval_minutes = 0;
        assert!(config
            .problems()
            .iter()
            .any(|p| p.contains("interval_minutes")));

        config.sync.mode = SyncMode::OnClose;
        assert!(!config
            .problems()
            .iter()
            .any(|p| p.contains("interval_minutes")));
    }

    #[test]
    fn test_huge_interval_rejected_without_overflow() {
        let temp = TempDir::new().unwrap();
        let mut config = complete_config(temp.path(), &temp.path().with_extension("bak"));
        config.sync.mode = SyncMode::Interval;
        config.sync.interval_minutes = u64::MAX;

        assert_eq!(config.sync.interval(), Some(Duration::from_secs(u64::MAX)));
        assert!(config
            .problems()
            .iter()
            .any(|p| p.contains("at most")));

        config.sync.interval_minutes = MAX_INTERVAL_MINUTES;
        config.validate().unwrap();
    }

    #[test]
    fn test_backup_directory_inside_vault_rejected() {
        let temp = TempDir::new().unwrap();
        let config = complete_config(temp.path(), &temp.path().join("backups"));
        assert!(config
            .problems()
            .iter()
            .any(|p| p.contains("inside the vault")));
    }

    #[test]
    fn test_disabled_backups_need_no_directory() {
        let temp = TempDir::new().unwrap();
        let mut config = complete_config(temp.path(), Path::new(""));
        config.backup.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_interval_only_in_interval_mode() {
        let mut settings = SyncSettings::default();
        assert_eq!(settings.interval(), None);
        settings.mode = SyncMode::Interval;
        settings.interval_minutes = 5;
        assert_eq!(settings.interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_parse_toml_with_defaults() {
        let config = Configuration::from_toml_str(
            r#"
            [vault]
            path = "/notes"

            [sync]
            mode = "interval"
            interval_minutes = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.vault.path, PathBuf::from("/notes"));
        assert_eq!(config.vault.branch, "main");
        assert_eq!(config.sync.mode, SyncMode::Interval);
        assert_eq!(config.sync.interval_minutes, 15);
        assert!(config.backup.enabled);
        assert_eq!(config.backup.max_backups, 10);
        assert_eq!(config.git.timeout_secs, 300);
    }

    #[test]
    fn test_unknown_mode_is_config_error() {
        let err = Configuration::from_toml_str("[sync]\nmode = \"hourly\"\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_template_parses() {
        let config = Configuration::from_toml_str(&Configuration::template()).unwrap();
        assert_eq!(config.sync.mode, SyncMode::OnClose);
        assert!(!config.git.gitignore.is_empty());
    }

    #[test]
    fn test_credentials_resolution() {
        let mut git = GitSettings::default();
        let creds = Configuration::resolve_credentials(&git, Some("abc".into()));
        assert!(matches!(creds, RemoteCredentials::Token(ref t) if t.expose() == "abc"));

        let creds = Configuration::resolve_credentials(&git, None);
        assert!(matches!(creds, RemoteCredentials::Ambient));

        git.ssh_identity = Some(PathBuf::from("/keys/id"));
        let creds = Configuration::resolve_credentials(&git, Some("abc".into()));
        assert!(matches!(creds, RemoteCredentials::SshIdentity(_)));
    }

    #[test]
    fn test_token_never_printed() {
        let creds = RemoteCredentials::Token(SecretToken::new("ghp_secret"));
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("ghp_secret"));

        let mut config = Configuration::default();
        config.credentials = creds;
        assert!(!config.to_toml_string().unwrap().contains("ghp_secret"));
    }

    #[test]
    fn test_sync_mode_from_str() {
        assert_eq!("on-close".parse::<SyncMode>().unwrap(), SyncMode::OnClose);
        assert_eq!("Interval".parse::<SyncMode>().unwrap(), SyncMode::Interval);
        assert!("weekly".parse::<SyncMode>().is_err());
    }
}
