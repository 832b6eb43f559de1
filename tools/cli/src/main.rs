//! VaultSync CLI - control surface for the vault sync daemon.
//!
//! Starts and stops the background daemon, reports its status, runs
//! one-off syncs and manages configuration and backups.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vaultsync_common::{Configuration, SyncMode, SyncOutcome};
use vaultsync_sync::{BackupManager, Daemon, InstanceGuard, InstanceStatus};
use vaultsync_vcs::GitClient;

#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "VaultSync - keep a notes vault in sync with a git remote")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: <config dir>/vaultsync/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// One-run overrides of the configuration file.
#[derive(clap::Args, Debug, Default, Clone)]
struct Overrides {
    /// Sync mode: "on_close" or "interval".
    #[arg(long)]
    mode: Option<SyncMode>,

    /// Minutes between pushes in interval mode.
    #[arg(long)]
    interval: Option<u64>,

    /// Do not back up the vault before pushing.
    #[arg(long)]
    no_backup: bool,

    /// Number of backups to keep (0 keeps all).
    #[arg(long)]
    max_backups: Option<u32>,
}

/// Settings persisted by `config set`.
#[derive(clap::Args, Debug, Default, Clone)]
struct SettingArgs {
    /// Vault directory to sync.
    #[arg(long)]
    vault_path: Option<PathBuf>,

    /// Branch to sync.
    #[arg(long)]
    branch: Option<String>,

    /// Sync mode: "on_close" or "interval".
    #[arg(long)]
    mode: Option<SyncMode>,

    /// Minutes between pushes in interval mode.
    #[arg(long)]
    interval: Option<u64>,

    /// Back up the vault before each push.
    #[arg(long, action = clap::ArgAction::Set)]
    backup: Option<bool>,

    /// Directory holding backups.
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Number of backups to keep (0 keeps all).
    #[arg(long)]
    max_backups: Option<u32>,

    /// Show desktop notifications.
    #[arg(long, action = clap::ArgAction::Set)]
    notifications: Option<bool>,

    /// Author name for sync commits.
    #[arg(long)]
    git_username: Option<String>,

    /// Author email for sync commits.
    #[arg(long)]
    git_email: Option<String>,

    /// Remote repository URL, without credentials.
    #[arg(long)]
    remote_url: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration.
    Show,

    /// Change settings in the configuration file.
    Set {
        #[command(flatten)]
        settings: SettingArgs,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Log to the state directory instead of the terminal.
        #[arg(long, hide = true)]
        background: bool,
    },

    /// Start the daemon in the background.
    Start {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Ask the running daemon to stop after its current sync.
    Stop {
        /// Seconds to wait for the daemon to exit.
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Show whether a daemon is running for the configured vault.
    Status,

    /// Pull and push once.
    Sync,

    /// Validate the configuration and environment.
    Check,

    /// Show or change the configuration (default: show).
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },

    /// Write a starter configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Inspect and restore vault backups.
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List backups, newest first.
    List,

    /// Copy a backup into an empty directory.
    Restore {
        /// Backup identifier as shown by `backups list`.
        id: String,

        /// Target directory (must be empty or missing).
        #[arg(long)]
        to: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Run {
        background: true, ..
    } = &cli.command
    {
        let config = load_config(cli.config.as_deref())?;
        let log_path = config.resolved_state_dir()?.join("vaultsync.log");
        init_logging(cli.verbose, Some(&log_path))?;
    } else {
        init_logging(cli.verbose, None)?;
    }

    let config_path = cli.config.clone();
    match cli.command {
        Commands::Run { overrides, .. } => cmd_run(config_path.as_deref(), &overrides).await,
        Commands::Start { overrides } => cmd_start(config_path.as_deref(), &overrides, cli.verbose).await,
        Commands::Stop { wait } => cmd_stop(config_path.as_deref(), wait).await,
        Commands::Status => cmd_status(config_path.as_deref()).await,
        Commands::Sync => cmd_sync(config_path.as_deref()).await,
        Commands::Check => cmd_check(config_path.as_deref()).await,
        Commands::Config { command } => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => cmd_config(config_path.as_deref()),
            ConfigCommands::Set { settings } => cmd_config_set(config_path.as_deref(), &settings),
        },
        Commands::Init { force } => cmd_init(config_path.as_deref(), force),
        Commands::Backups { command } => match command {
            BackupCommands::List => cmd_backups_list(config_path.as_deref()).await,
            BackupCommands::Restore { id, to } => {
                cmd_backups_restore(config_path.as_deref(), &id, &to).await
            }
        },
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "vaultsync", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
    }
    Ok(())
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Configuration::default_path()
            .context("Cannot determine the configuration directory; pass --config"),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Configuration> {
    let path = resolve_config_path(explicit)?;
    debug!(path = %path.display(), "Loading configuration");
    Configuration::load(&path).with_context(|| {
        format!(
            "Failed to load configuration from {} (run `vaultsync init` to create one)",
            path.display()
        )
    })
}

fn apply_overrides(config: &mut Configuration, overrides: &Overrides) {
    if let Some(mode) = overrides.mode {
        config.sync.mode = mode;
    }
    if let Some(minutes) = overrides.interval {
        config.sync.interval_minutes = minutes;
    }
    if overrides.no_backup {
        config.backup.enabled = false;
    }
    if let Some(max) = overrides.max_backups {
        config.backup.max_backups = max;
    }
}

/// Arguments that forward the overrides to a spawned `run`.
fn override_args(overrides: &Overrides) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(mode) = overrides.mode {
        args.push(format!("--mode={}", mode));
    }
    if let Some(minutes) = overrides.interval {
        args.push(format!("--interval={}", minutes));
    }
    if overrides.no_backup {
        args.push("--no-backup".to_string());
    }
    if let Some(max) = overrides.max_backups {
        args.push(format!("--max-backups={}", max));
    }
    args
}

fn guard_for(config: &Configuration) -> Result<InstanceGuard> {
    Ok(InstanceGuard::new(config.resolved_state_dir()?))
}

/// Run the daemon in the foreground.
async fn cmd_run(config_path: Option<&Path>, overrides: &Overrides) -> Result<()> {
    let mut config = load_config(config_path)?;
    apply_overrides(&mut config, overrides);

    let vcs = Arc::new(GitClient::from_config(&config));
    let daemon = Daemon::new(config, vcs).context("Cannot start daemon")?;
    daemon.run().await.context("Daemon stopped with an error")?;
    Ok(())
}

/// Spawn `run` as a detached background process.
async fn cmd_start(config_path: Option<&Path>, overrides: &Overrides, verbose: bool) -> Result<()> {
    let path = config_path_absolute(config_path)?;
    let mut config = load_config(Some(&path))?;
    apply_overrides(&mut config, overrides);
    config.validate().context("Configuration is not valid")?;

    let guard = guard_for(&config)?;
    if let InstanceStatus::Running { pid, since } = guard.status(&config.vault.path)? {
        anyhow::bail!("VaultSync is already running (pid {}, since {})", pid, since);
    }

    let exe = std::env::current_exe().context("Cannot locate the vaultsync executable")?;
    let mut command = std::process::Command::new(exe);
    command.arg("--config").arg(&path);
    if verbose {
        command.arg("--verbose");
    }
    command
        .arg("run")
        .arg("--background")
        .args(override_args(overrides))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().context("Failed to spawn background daemon")?;
    let pid = child.id();

    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Some(status) = child.try_wait()? {
        let log = config.resolved_state_dir()?.join("vaultsync.log");
        anyhow::bail!(
            "Daemon exited immediately ({}); see {}",
            status,
            log.display()
        );
    }

    println!("VaultSync started (pid {})", pid);
    println!(
        "  Log: {}",
        config.resolved_state_dir()?.join("vaultsync.log").display()
    );
    Ok(())
}

fn config_path_absolute(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = resolve_config_path(explicit)?;
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Request a graceful stop and wait for the daemon to exit.
async fn cmd_stop(config_path: Option<&Path>, wait: u64) -> Result<()> {
    let config = load_config(config_path)?;
    let guard = guard_for(&config)?;

    let Some(pid) = guard.request_stop(&config.vault.path)? else {
        println!("VaultSync is not running.");
        return Ok(());
    };
    println!("Stop requested (pid {}), waiting for the current sync to finish...", pid);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    while tokio::time::Instant::now() < deadline {
        if guard.status(&config.vault.path)? == InstanceStatus::NotRunning {
            println!("VaultSync stopped.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!(
        "VaultSync (pid {}) is still running after {}s; it stops once the current sync completes",
        pid,
        wait
    )
}

/// Show daemon status and a configuration summary.
async fn cmd_status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let guard = guard_for(&config)?;

    match guard.status(&config.vault.path)? {
        InstanceStatus::Running { pid, since } => {
            let local = since.with_timezone(&chrono::Local);
            println!("VaultSync is running");
            println!("  PID: {}", pid);
            println!("  Since: {}", local.format("%Y-%m-%d %H:%M:%S"));
        }
        InstanceStatus::NotRunning => println!("VaultSync is not running"),
    }

    println!("  Vault: {}", config.vault.path.display());
    println!("  Branch: {}", config.vault.branch);
    match config.sync.interval() {
        Some(interval) => println!("  Mode: interval ({} min)", interval.as_secs() / 60),
        None => println!("  Mode: {} ({})", config.sync.mode, config.sync.process_name),
    }

    if config.backup.enabled {
        let manager = BackupManager::open(&config.backup.directory).await?;
        let records = manager.list().await?;
        match records.first() {
            Some(latest) => println!(
                "  Backups: {} (latest {})",
                records.len(),
                latest.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("  Backups: none yet"),
        }
    } else {
        println!("  Backups: disabled");
    }
    Ok(())
}

/// One manual sync, delegated to the daemon when one is running.
async fn cmd_sync(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate().context("Configuration is not valid")?;
    let guard = guard_for(&config)?;

    if let Some(pid) = guard.request_sync(&config.vault.path)? {
        println!("Sync requested from the running daemon (pid {}).", pid);
        return Ok(());
    }

    info!("No daemon running, syncing directly");
    let vcs = Arc::new(GitClient::from_config(&config));
    let outcomes = Daemon::new(config, vcs)?
        .without_signal_handlers()
        .run_once()
        .await
        .context("Sync failed")?;

    for outcome in &outcomes {
        println!("{}", outcome);
    }
    if outcomes.iter().any(SyncOutcome::is_failure) {
        anyhow::bail!("Sync did not complete");
    }
    Ok(())
}

/// Validate configuration completeness and the environment.
async fn cmd_check(config_path: Option<&Path>) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let config = load_config(Some(&path))?;
    println!("Configuration: {}", path.display());

    let problems = config.problems();
    for problem in &problems {
        println!("  ✗ {}", problem);
    }

    let git = tokio::process::Command::new("git")
        .arg("--version")
        .output()
        .await;
    let git_ok = matches!(&git, Ok(output) if output.status.success());
    match git {
        Ok(output) if output.status.success() => {
            println!("  ✓ {}", String::from_utf8_lossy(&output.stdout).trim())
        }
        _ => println!("  ✗ git executable not found"),
    }
    println!("  Credentials: {}", config.credentials.kind());

    if !problems.is_empty() || !git_ok {
        anyhow::bail!("{} problem(s) found", problems.len() + usize::from(!git_ok));
    }
    println!("Configuration is valid.");
    Ok(())
}

/// Print the effective configuration with secrets left out.
fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let config = load_config(Some(&path))?;
    println!("# {}", path.display());
    println!("# credentials: {}", config.credentials.kind());
    print!("{}", config.to_toml_string()?);
    Ok(())
}

/// Apply the given settings; returns how many were given.
fn apply_settings(config: &mut Configuration, settings: &SettingArgs, cwd: &Path) -> usize {
    let absolute = |path: &PathBuf| {
        if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        }
    };

    let mut changed = 0;

    if let Some(path) = &settings.vault_path {
        config.vault.path = absolute(path);
        changed += 1;
    }
    if let Some(branch) = &settings.branch {
        config.vault.branch = branch.trim().to_string();
        changed += 1;
    }
    if let Some(mode) = settings.mode {
        config.sync.mode = mode;
        changed += 1;
    }
    if let Some(minutes) = settings.interval {
        config.sync.interval_minutes = minutes;
        changed += 1;
    }
    if let Some(enabled) = settings.backup {
        config.backup.enabled = enabled;
        changed += 1;
    }
    if let Some(dir) = &settings.backup_dir {
        config.backup.directory = absolute(dir);
        changed += 1;
    }
    if let Some(max) = settings.max_backups {
        config.backup.max_backups = max;
        changed += 1;
    }
    if let Some(enabled) = settings.notifications {
        config.notification.enabled = enabled;
        changed += 1;
    }
    if let Some(name) = &settings.git_username {
        config.git.user_name = name.trim().to_string();
        changed += 1;
    }
    if let Some(email) = &settings.git_email {
        config.git.user_email = email.trim().to_string();
        changed += 1;
    }
    if let Some(url) = &settings.remote_url {
        config.git.remote_url = url.trim().to_string();
        changed += 1;
    }
    changed
}

/// Persist settings to the configuration file and re-validate it.
fn cmd_config_set(config_path: Option<&Path>, settings: &SettingArgs) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read {} (run `vaultsync init` to create one)",
            path.display()
        )
    })?;
    let mut config = Configuration::from_toml_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let cwd = std::env::current_dir()?;
    if apply_settings(&mut config, settings, &cwd) == 0 {
        anyhow::bail!("Nothing to set; see `vaultsync config set --help`");
    }

    std::fs::write(&path, config.to_toml_string()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Configuration updated");
    println!("Configuration saved to {}", path.display());

    let problems = config.problems();
    if problems.is_empty() {
        println!("Configuration is valid.");
    } else {
        println!("Still incomplete:");
        for problem in &problems {
            println!("  ✗ {}", problem);
        }
    }
    Ok(())
}

/// Write the starter configuration.
fn cmd_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, Configuration::template())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Configuration written to {}", path.display());
    println!("Edit it, then run `vaultsync check`.");
    Ok(())
}

async fn backup_manager(config_path: Option<&Path>) -> Result<BackupManager> {
    let config = load_config(config_path)?;
    if config.backup.directory.as_os_str().is_empty() {
        anyhow::bail!("backup.directory is not set");
    }
    BackupManager::open(&config.backup.directory)
        .await
        .context("Failed to open backup directory")
}

async fn cmd_backups_list(config_path: Option<&Path>) -> Result<()> {
    let manager = backup_manager(config_path).await?;
    let records = manager.list().await?;

    if records.is_empty() {
        println!("No backups in {}.", manager.directory().display());
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {} files  {} bytes",
            record.id,
            record.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            record.file_count,
            record.size_bytes
        );
    }
    Ok(())
}

async fn cmd_backups_restore(config_path: Option<&Path>, id: &str, to: &Path) -> Result<()> {
    let manager = backup_manager(config_path).await?;
    let record = manager
        .restore(id, to)
        .await
        .with_context(|| format!("Failed to restore {}", id))?;
    println!(
        "Restored {} ({} files) to {}",
        record.id,
        record.file_count,
        to.display()
    );
    Ok(())
}
