//! Process table access and the edge-triggered process watcher.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info};

use vaultsync_common::SyncTrigger;

use crate::scheduler::TriggerQueue;

/// Read-only view of the operating system's processes.
pub trait ProcessTable: Send + Sync {
    /// Start time of a live process, `None` when it does not exist.
    fn start_time(&self, pid: u32) -> Option<u64>;

    /// Whether any process with this executable name is running.
    fn is_running_named(&self, name: &str) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

fn name_matches(candidate: &str, wanted: &str) -> bool {
    let strip = |s: &str| {
        let lower = s.to_lowercase();
        lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
    };
    strip(candidate) == strip(wanted)
}

impl ProcessTable for SystemProcessTable {
    fn start_time(&self, pid: u32) -> Option<u64> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .filter(|p| p.status() != ProcessStatus::Zombie)
            .map(|p| p.start_time())
    }

    fn is_running_named(&self, name: &str) -> bool {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::All, true);
        system.processes().values().any(|p| {
            p.status() != ProcessStatus::Zombie && name_matches(&p.name().to_string_lossy(), name)
        })
    }
}

/// Turns periodic observations of a named process into start/stop edges.
pub struct ProcessWatcher {
    table: Arc<dyn ProcessTable>,
    process_name: String,
    poll_interval: Duration,
    last_seen: Option<bool>,
}

impl ProcessWatcher {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        process_name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            table,
            process_name: process_name.into(),
            poll_interval,
            last_seen: None,
        }
    }

    /// Observe the process once.
    ///
    /// The first observation only records the current state; later ones
    /// return a trigger when the state flipped.
    pub fn poll(&mut self) -> Option<SyncTrigger> {
        let running = self.table.is_running_named(&self.process_name);
        let previous = self.last_seen.replace(running);

        match previous {
            None => {
                debug!(process = %self.process_name, running, "Initial process state");
                None
            }
            Some(was) if was == running => None,
            Some(_) if running => {
                info!(process = %self.process_name, "Process started");
                Some(SyncTrigger::ProcessStarted)
            }
            Some(_) => {
                info!(process = %self.process_name, "Process stopped");
                Some(SyncTrigger::ProcessStopped)
            }
        }
    }

    /// Poll until the queue closes, pushing every edge into it.
    pub async fn run(mut self, queue: Arc<TriggerQueue>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !queue.is_closed() {
            ticker.tick().await;
            if let Some(trigger) = self.poll() {
                queue.push(trigger);
            }
        }
        debug!("Process watcher stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Hand-driven process table.
    #[derive(Default)]
    pub(crate) struct FakeProcessTable {
        pids: Mutex<HashMap<u32, u64>>,
        names: Mutex<HashSet<String>>,
    }

    impl FakeProcessTable {
        pub(crate) fn spawn(&self, pid: u32, start_time: u64) {
            self.pids.lock().unwrap().insert(pid, start_time);
        }

        pub(crate) fn kill(&self, pid: u32) {
            self.pids.lock().unwrap().remove(&pid);
        }

        pub(crate) fn set_running(&self, name: &str, running: bool) {
            let mut names = self.names.lock().unwrap();
            if running {
                names.insert(name.to_string());
            } else {
                names.remove(name);
            }
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn start_time(&self, pid: u32) -> Option<u64> {
            self.pids.lock().unwrap().get(&pid).copied()
        }

        fn is_running_named(&self, name: &str) -> bool {
            self.names.lock().unwrap().contains(name)
        }
    }

    #[test]
    fn test_name_matching() {
        assert!(name_matches("Obsidian.exe", "obsidian"));
        assert!(name_matches("obsidian", "Obsidian"));
        assert!(!name_matches("obsidian-helper", "obsidian"));
    }

    #[test]
    fn test_first_observation_emits_nothing() {
        let table = Arc::new(FakeProcessTable::default());
        table.set_running("obsidian", true);
        let mut watcher = ProcessWatcher::new(table.clone(), "obsidian", Duration::from_secs(1));

        assert_eq!(watcher.poll(), None);
        assert_eq!(watcher.poll(), None);
    }

    #[test]
    fn test_edges() {
        let table = Arc::new(FakeProcessTable::default());
        let mut watcher = ProcessWatcher::new(table.clone(), "obsidian", Duration::from_secs(1));
        assert_eq!(watcher.poll(), None);

        table.set_running("obsidian", true);
        assert_eq!(watcher.poll(), Some(SyncTrigger::ProcessStarted));
        assert_eq!(watcher.poll(), None);

        table.set_running("obsidian", false);
        assert_eq!(watcher.poll(), Some(SyncTrigger::ProcessStopped));
        assert_eq!(watcher.poll(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_feeds_queue() {
        let table = Arc::new(FakeProcessTable::default());
        let queue = Arc::new(TriggerQueue::new(Duration::ZERO));
        let watcher = ProcessWatcher::new(table.clone(), "obsidian", Duration::from_secs(3));
        let task = tokio::spawn(watcher.run(queue.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        table.set_running("obsidian", true);
        assert_eq!(queue.next().await, Some(SyncTrigger::ProcessStarted));

        table.set_running("obsidian", false);
        assert_eq!(queue.next().await, Some(SyncTrigger::ProcessStopped));

        queue.close();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(task.is_finished());
    }

    #[test]
    fn test_system_table_sees_current_process() {
        let table = SystemProcessTable::new();
        assert!(table.start_time(std::process::id()).is_some());
    }
}
