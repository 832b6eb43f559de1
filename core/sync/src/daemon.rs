//! Wires producers, the engine and the instance lock into a running daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vaultsync_common::{
    Configuration, ManualAction, Result, SyncOutcome, SyncTrigger,
};
use vaultsync_vcs::VersionControlClient;

use crate::backup::BackupManager;
use crate::engine::SyncEngine;
use crate::guard::{ControlMarkers, InstanceGuard, InstanceLock};
use crate::notify::{DaemonEvent, DesktopNotifier, FanOut, LogSink, NotificationSink};
use crate::scheduler::TriggerQueue;
use crate::watcher::{ProcessTable, ProcessWatcher, SystemProcessTable};

/// A configured daemon, ready to run against one vault.
pub struct Daemon {
    config: Configuration,
    vcs: Arc<dyn VersionControlClient>,
    sink: Arc<dyn NotificationSink>,
    processes: Arc<dyn ProcessTable>,
    state_dir: PathBuf,
    guard: InstanceGuard,
    handle_signals: bool,
}

impl Daemon {
    /// Build a daemon from a configuration. Fails with `ConfigInvalid` when
    /// the configuration is incomplete.
    pub fn new(config: Configuration, vcs: Arc<dyn VersionControlClient>) -> Result<Self> {
        config.validate()?;
        let state_dir = config.resolved_state_dir()?;
        let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());

        let sink = FanOut::new()
            .with(Arc::new(LogSink))
            .with(Arc::new(DesktopNotifier::new(&config.notification)));

        Ok(Self {
            guard: InstanceGuard::with_process_table(&state_dir, processes.clone()),
            state_dir,
            config,
            vcs,
            sink: Arc::new(sink),
            processes,
            handle_signals: true,
        })
    }

    /// Replace the notification sink.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use another process table for both liveness checks and the watcher.
    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.guard = InstanceGuard::with_process_table(&self.state_dir, processes.clone());
        self.processes = processes;
        self
    }

    /// Do not install Ctrl-C / SIGTERM handlers.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn guard(&self) -> &InstanceGuard {
        &self.guard
    }

    async fn engine(&self) -> Result<SyncEngine> {
        let engine = SyncEngine::new(
            self.vcs.clone(),
            self.sink.clone(),
            self.config.sync.mode,
            &self.config.vault.path,
        );
        if !self.config.backup.enabled {
            debug!("Backups disabled");
            return Ok(engine);
        }
        let manager = BackupManager::open(&self.config.backup.directory).await?;
        Ok(engine.with_backups(manager, self.config.backup.max_backups))
    }

    /// Take the lock, prepare the repository and build the engine. A failure
    /// is reported to the sink before it is returned.
    async fn start(&self) -> Result<(InstanceLock, SyncEngine)> {
        let started = self.try_start().await;
        if let Err(e) = &started {
            self.sink.lifecycle(&DaemonEvent::StartFailed {
                cause: e.to_string(),
            });
        }
        started
    }

    async fn try_start(&self) -> Result<(InstanceLock, SyncEngine)> {
        let lock = self.guard.acquire(&self.config.vault.path)?;
        info!(
            vault = %self.config.vault.path.display(),
            client = self.vcs.name(),
            "Preparing repository"
        );
        self.vcs.prepare().await?;
        let engine = self.engine().await?;
        Ok((lock, engine))
    }

    /// Run until a stop request or signal arrives.
    pub async fn run(self) -> Result<()> {
        let (mut lock, mut engine) = self.start().await?;
        info!(mode = %self.config.sync.mode, "Sync mode");
        self.sink.lifecycle(&DaemonEvent::Started {
            vault: lock.record().vault_path.clone(),
            pid: lock.record().pid,
        });

        engine.startup_pull().await;

        let queue = Arc::new(TriggerQueue::new(self.config.sync.debounce()));
        let mut tasks = vec![
            self.spawn_watcher(queue.clone()),
            spawn_marker_poller(lock.markers(), self.config.sync.poll_interval(), queue.clone()),
        ];
        if let Some(interval) = self.config.sync.interval() {
            tasks.push(spawn_ticker(interval, queue.clone()));
        }
        if self.handle_signals {
            tasks.push(spawn_signal_listener(queue.clone()));
        }

        engine.run(&queue).await;

        for task in &tasks {
            task.abort();
        }
        lock.release()?;
        self.sink.lifecycle(&DaemonEvent::Stopped);
        Ok(())
    }

    /// One manual sync (pull, then the push sequence) under the lock.
    pub async fn run_once(self) -> Result<Vec<SyncOutcome>> {
        let (mut lock, mut engine) = self.start().await?;
        let outcomes = engine
            .handle(SyncTrigger::ManualRequest(ManualAction::Sync))
            .await;
        lock.release()?;
        Ok(outcomes)
    }

    fn spawn_watcher(&self, queue: Arc<TriggerQueue>) -> JoinHandle<()> {
        let watcher = ProcessWatcher::new(
            self.processes.clone(),
            self.config.sync.process_name.clone(),
            self.config.sync.poll_interval(),
        );
        tokio::spawn(watcher.run(queue))
    }
}

fn spawn_ticker(interval: Duration, queue: Arc<TriggerQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(minutes = interval.as_secs() / 60, "Interval sync enabled");

        while !queue.is_closed() {
            ticker.tick().await;
            queue.push(SyncTrigger::IntervalElapsed);
        }
    })
}

fn spawn_marker_poller(
    markers: ControlMarkers,
    every: Duration,
    queue: Arc<TriggerQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        while !queue.is_closed() {
            ticker.tick().await;
            for action in markers.take() {
                queue.push(SyncTrigger::ManualRequest(action));
            }
        }
    })
}

fn spawn_signal_listener(queue: Arc<TriggerQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Cannot listen for Ctrl-C");
                    return;
                }
                info!("Interrupt received, stopping after the current attempt");
            }
            _ = terminate => info!("Termination requested, stopping after the current attempt"),
        }
        queue.push(SyncTrigger::ManualRequest(ManualAction::Stop));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::InstanceStatus;
    use crate::notify::MemorySink;
    use crate::watcher::tests::FakeProcessTable;
    use std::path::Path;
    use tempfile::TempDir;
    use vaultsync_common::{Error, SyncDirection, SyncMode};
    use vaultsync_vcs::{ScriptedClient, VcsCall};

    fn config(root: &Path) -> Configuration {
        let vault = root.join("vault");
        std::fs::create_dir_all(&vault).unwrap();
        std::fs::write(vault.join("note.md"), "hi").unwrap();

        let mut config = Configuration::default();
        config.state_dir = Some(root.join("state"));
        config.vault.path = vault;
        config.backup.directory = root.join("backups");
        config.git.remote_url = "https://example.com/vault.git".into();
        config.git.user_name = "Test".into();
        config.git.user_email = "test@example.com".into();
        config.sync.poll_interval_secs = 1;
        config
    }

    fn daemon(config: Configuration, vcs: Arc<ScriptedClient>) -> (Daemon, Arc<MemorySink>, Arc<FakeProcessTable>) {
        let sink = Arc::new(MemorySink::new());
        let table = Arc::new(FakeProcessTable::default());
        table.spawn(std::process::id(), 1);
        let daemon = Daemon::new(config, vcs)
            .unwrap()
            .with_sink(sink.clone())
            .with_process_table(table.clone())
            .without_signal_handlers();
        (daemon, sink, table)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Daemon::new(Configuration::default(), Arc::new(ScriptedClient::new()));
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_run_once_pulls_then_pushes_with_backup() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path());
        let backups = config.backup.directory.clone();
        let vcs = Arc::new(ScriptedClient::new());
        let (daemon, sink, _) = daemon(config, vcs.clone());
        let guard = daemon.guard().clone();
        let vault = temp.path().join("vault");

        let outcomes = daemon.run_once().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].direction(), Some(SyncDirection::Pull));
        assert_eq!(outcomes[1].direction(), Some(SyncDirection::Push));
        assert_eq!(sink.outcomes(), outcomes);
        assert_eq!(
            vcs.calls(),
            vec![VcsCall::Prepare, VcsCall::Pull, VcsCall::Status, VcsCall::Push]
        );

        let manager = BackupManager::open(&backups).await.unwrap();
        assert_eq!(manager.list().await.unwrap().len(), 1);
        assert_eq!(guard.status(&vault).unwrap(), InstanceStatus::NotRunning);
    }

    #[tokio::test]
    async fn test_prepare_failure_releases_lock() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(ScriptedClient::new());
        vcs.fail_prepare("remote unreachable");
        let (daemon, sink, _) = daemon(config(temp.path()), vcs);
        let guard = daemon.guard().clone();

        assert!(daemon.run().await.is_err());
        assert_eq!(
            guard.status(temp.path().join("vault")).unwrap(),
            InstanceStatus::NotRunning
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DaemonEvent::StartFailed { cause } => assert!(cause.contains("remote unreachable")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_instance_reports_start_failure() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path());
        let vault = config.vault.path.clone();
        let (daemon, sink, _) = daemon(config, Arc::new(ScriptedClient::new()));
        let _held = daemon.guard().acquire(&vault).unwrap();

        assert!(matches!(
            daemon.run_once().await,
            Err(Error::AlreadyRunning { .. })
        ));
        assert!(matches!(
            sink.events().as_slice(),
            [DaemonEvent::StartFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn test_run_reacts_to_process_and_stop_marker() {
        let temp = TempDir::new().unwrap();
        let mut config = config(temp.path());
        config.sync.mode = SyncMode::OnClose;
        config.sync.debounce_secs = 0;
        let vault = config.vault.path.clone();
        let vcs = Arc::new(ScriptedClient::new());
        let (daemon, sink, table) = daemon(config, vcs.clone());
        let guard = daemon.guard().clone();

        let running = tokio::spawn(daemon.run());

        wait_until(|| vcs.count(VcsCall::Pull) == 1).await;
        assert!(matches!(
            guard.status(&vault).unwrap(),
            InstanceStatus::Running { .. }
        ));
        assert!(matches!(
            guard.acquire(&vault),
            Err(Error::AlreadyRunning { .. })
        ));

        // Let the watcher record its initial observation first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let name = Configuration::default().sync.process_name;
        table.set_running(&name, true);
        wait_until(|| vcs.count(VcsCall::Pull) == 2).await;
        table.set_running(&name, false);
        wait_until(|| vcs.count(VcsCall::Push) == 1).await;

        assert!(guard.request_stop(&vault).unwrap().is_some());
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // startup pull + pull on start, then backup and push on close
        assert_eq!(vcs.count(VcsCall::Pull), 2);
        assert_eq!(vcs.count(VcsCall::Push), 1);
        assert_eq!(guard.status(&vault).unwrap(), InstanceStatus::NotRunning);

        let events = sink.events();
        assert!(matches!(
            events.as_slice(),
            [DaemonEvent::Started { .. }, DaemonEvent::Stopped]
        ));
    }
}
