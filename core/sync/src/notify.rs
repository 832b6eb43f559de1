//! Notification sinks for sync outcomes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use vaultsync_common::{NotificationSettings, SyncOutcome};

/// Daemon lifecycle changes reported alongside sync outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    Started { vault: PathBuf, pid: u32 },
    Stopped,
    /// The daemon could not take the lock, prepare the repository or open
    /// the backup directory.
    StartFailed { cause: String },
}

/// Receives every sync outcome.
///
/// Implementations must return promptly and must not fail; delivery
/// problems are theirs to log.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, outcome: &SyncOutcome);

    fn lifecycle(&self, _event: &DaemonEvent) {}
}

/// Writes each outcome to the log at a level matching its class.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Success { direction, changed } => {
                info!(%direction, changed, "Sync succeeded")
            }
            SyncOutcome::Skipped { reason } => debug!(%reason, "Sync skipped"),
            SyncOutcome::Conflict { direction, details } => {
                warn!(%direction, %details, "Sync needs manual resolution")
            }
            SyncOutcome::TransportFailure { direction, cause } => {
                error!(%direction, %cause, "Sync failed")
            }
        }
    }

    fn lifecycle(&self, event: &DaemonEvent) {
        match event {
            DaemonEvent::Started { vault, pid } => {
                info!(vault = %vault.display(), pid, "VaultSync daemon started")
            }
            DaemonEvent::Stopped => info!("VaultSync daemon stopped"),
            DaemonEvent::StartFailed { cause } => error!(%cause, "VaultSync daemon failed to start"),
        }
    }
}

/// Forwards every outcome to several sinks.
#[derive(Default, Clone)]
pub struct FanOut {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for FanOut {
    fn notify(&self, outcome: &SyncOutcome) {
        for sink in &self.sinks {
            sink.notify(outcome);
        }
    }

    fn lifecycle(&self, event: &DaemonEvent) {
        for sink in &self.sinks {
            sink.lifecycle(event);
        }
    }
}

/// Keeps every outcome and lifecycle event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    outcomes: Mutex<Vec<SyncOutcome>>,
    events: Mutex<Vec<DaemonEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<SyncOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<DaemonEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, outcome: &SyncOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome.clone());
    }

    fn lifecycle(&self, event: &DaemonEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[derive(Debug, Default)]
struct Throttle {
    last_shown: Option<Instant>,
    recent: VecDeque<(String, Instant)>,
}

/// Shows desktop notifications through the platform's notifier command.
///
/// Only outcomes a user needs to see are shown: conflicts, failures and
/// successes that actually moved data. Notifications closer together than
/// `min_interval`, or repeating a text shown within `duplicate_window`, are
/// dropped.
pub struct DesktopNotifier {
    enabled: bool,
    min_interval: Duration,
    duplicate_window: Duration,
    throttle: Mutex<Throttle>,
}

impl DesktopNotifier {
    pub fn new(settings: &NotificationSettings) -> Self {
        Self {
            enabled: settings.enabled,
            min_interval: Duration::from_secs(settings.min_interval_secs),
            duplicate_window: Duration::from_secs(settings.duplicate_window_secs),
            throttle: Mutex::new(Throttle::default()),
        }
    }

    /// Title and body for an outcome, or `None` if it is not shown.
    pub fn render(outcome: &SyncOutcome) -> Option<(&'static str, String)> {
        match outcome {
            SyncOutcome::Success {
                direction,
                changed: true,
            } => Some(("VaultSync", format!("{} completed", capitalize(&direction.to_string())))),
            SyncOutcome::Success { changed: false, .. } | SyncOutcome::Skipped { .. } => None,
            SyncOutcome::Conflict { details, .. } => {
                Some(("VaultSync conflict", format!("Manual resolution needed: {}", details)))
            }
            SyncOutcome::TransportFailure { direction, cause } => Some((
                "VaultSync error",
                format!("{} failed: {}", capitalize(&direction.to_string()), cause),
            )),
        }
    }

    /// Title and body for a lifecycle event.
    pub fn render_event(event: &DaemonEvent) -> (&'static str, String) {
        match event {
            DaemonEvent::Started { .. } => ("VaultSync", "Sync service started".to_string()),
            DaemonEvent::Stopped => ("VaultSync", "Sync service stopped".to_string()),
            DaemonEvent::StartFailed { cause } => {
                ("VaultSync error", format!("Could not start syncing: {}", cause))
            }
        }
    }

    fn show(&self, title: &str, body: &str) {
        if self.enabled && self.admit(body, Instant::now()) {
            Self::launch(title, body);
        }
    }

    /// Record an attempt to show `text` at `now`; returns whether it may be shown.
    fn admit(&self, text: &str, now: Instant) -> bool {
        let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());

        let window = self.duplicate_window;
        throttle
            .recent
            .retain(|(_, at)| now.duration_since(*at) < window);

        if throttle.recent.iter().any(|(seen, _)| seen == text) {
            debug!("Suppressing duplicate notification");
            return false;
        }
        if let Some(last) = throttle.last_shown {
            if now.duration_since(last) < self.min_interval {
                debug!("Notification rate limited");
                return false;
            }
        }

        throttle.last_shown = Some(now);
        throttle.recent.push_back((text.to_string(), now));
        true
    }

    fn launch(title: &str, body: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, skipping desktop notification");
            return;
        };
        let Some(mut cmd) = notifier_command(title, body) else {
            debug!("No desktop notifier on this platform");
            return;
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        match cmd.spawn() {
            Ok(mut child) => {
                runtime.spawn(async move {
                    if let Err(e) = child.wait().await {
                        debug!(error = %e, "Desktop notifier did not exit cleanly");
                    }
                });
            }
            Err(e) => debug!(error = %e, "Desktop notifier unavailable"),
        }
    }
}

/// Command showing one desktop notification, if the platform has one.
fn notifier_command(title: &str, body: &str) -> Option<Command> {
    if cfg!(target_os = "windows") {
        None
    } else if cfg!(target_os = "macos") {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            body.replace('"', "'"),
            title.replace('"', "'")
        );
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        Some(cmd)
    } else {
        let mut cmd = Command::new("notify-send");
        cmd.arg("--app-name=VaultSync").arg(title).arg(body);
        Some(cmd)
    }
}

impl NotificationSink for DesktopNotifier {
    fn notify(&self, outcome: &SyncOutcome) {
        if let Some((title, body)) = Self::render(outcome) {
            self.show(title, &body);
        }
    }

    fn lifecycle(&self, event: &DaemonEvent) {
        let (title, body) = Self::render_event(event);
        self.show(title, &body);
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_common::SyncDirection;

    fn notifier(min_interval: u64, window: u64) -> DesktopNotifier {
        DesktopNotifier::new(&NotificationSettings {
            enabled: true,
            min_interval_secs: min_interval,
            duplicate_window_secs: window,
        })
    }

    #[test]
    fn test_render_filters_quiet_outcomes() {
        assert!(DesktopNotifier::render(&SyncOutcome::skipped("x")).is_none());
        assert!(DesktopNotifier::render(&SyncOutcome::Success {
            direction: SyncDirection::Pull,
            changed: false
        })
        .is_none());

        let (_, body) = DesktopNotifier::render(&SyncOutcome::Success {
            direction: SyncDirection::Push,
            changed: true,
        })
        .unwrap();
        assert_eq!(body, "Push completed");

        let (title, body) = DesktopNotifier::render(&SyncOutcome::TransportFailure {
            direction: SyncDirection::Pull,
            cause: "offline".into(),
        })
        .unwrap();
        assert_eq!(title, "VaultSync error");
        assert_eq!(body, "Pull failed: offline");
    }

    #[test]
    fn test_rate_limit() {
        let notifier = notifier(5, 0);
        let start = Instant::now();
        assert!(notifier.admit("a", start));
        assert!(!notifier.admit("b", start + Duration::from_secs(2)));
        assert!(notifier.admit("c", start + Duration::from_secs(6)));
    }

    #[test]
    fn test_duplicate_suppression() {
        let notifier = notifier(0, 30);
        let start = Instant::now();
        assert!(notifier.admit("same", start));
        assert!(!notifier.admit("same", start + Duration::from_secs(10)));
        assert!(notifier.admit("other", start + Duration::from_secs(11)));
        assert!(notifier.admit("same", start + Duration::from_secs(31)));
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fan = FanOut::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(LogSink));
        assert_eq!(fan.len(), 3);

        fan.notify(&SyncOutcome::skipped("test"));
        assert_eq!(a.outcomes().len(), 1);
        assert_eq!(b.outcomes(), a.outcomes());
    }

    #[test]
    fn test_lifecycle_events_reach_every_sink() {
        let memory = Arc::new(MemorySink::new());
        let fan = FanOut::new().with(Arc::new(LogSink)).with(memory.clone());

        let failed = DaemonEvent::StartFailed {
            cause: "git executable not found in PATH".into(),
        };
        fan.lifecycle(&failed);
        assert_eq!(memory.events(), vec![failed.clone()]);
        assert!(memory.outcomes().is_empty());

        let (title, body) = DesktopNotifier::render_event(&failed);
        assert_eq!(title, "VaultSync error");
        assert!(body.contains("git executable not found"));
    }

    #[test]
    fn test_notifier_command_per_platform() {
        let program = notifier_command("VaultSync", "Pushed changes")
            .map(|cmd| cmd.as_std().get_program().to_string_lossy().into_owned());
        if cfg!(target_os = "windows") {
            assert_eq!(program, None);
        } else if cfg!(target_os = "macos") {
            assert_eq!(program.as_deref(), Some("osascript"));
        } else {
            assert_eq!(program.as_deref(), Some("notify-send"));
        }
    }

    #[test]
    fn test_launch_outside_runtime_is_skipped() {
        DesktopNotifier::launch("VaultSync", "Pushed changes");
    }

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = DesktopNotifier::new(&NotificationSettings {
            enabled: false,
            ..NotificationSettings::default()
        });
        notifier.notify(&SyncOutcome::Conflict {
            direction: SyncDirection::Push,
            details: "x".into(),
        });
        assert!(notifier.throttle.lock().unwrap().last_shown.is_none());
    }
}
