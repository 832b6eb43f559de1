//! In-process client with scripted outcomes, for tests and dry runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use vaultsync_common::{Error, RepoStatus, Result, VcsOutcome};

use crate::client::VersionControlClient;

/// A call recorded by [`ScriptedClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsCall {
    Prepare,
    Pull,
    Push,
    Status,
}

#[derive(Debug)]
struct Script {
    pulls: VecDeque<VcsOutcome>,
    pushes: VecDeque<VcsOutcome>,
    status: RepoStatus,
    calls: Vec<VcsCall>,
    delay: Option<Duration>,
    fail_prepare: Option<String>,
}

/// Version-control client whose answers are queued up front.
///
/// Once a queue runs dry, pulls report `Success { changed: false }` and
/// pushes report `Success { changed: true }`. The client also tracks how
/// many operations overlap so callers can assert single-writer behavior.
#[derive(Debug)]
pub struct ScriptedClient {
    script: Mutex<Script>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                pulls: VecDeque::new(),
                pushes: VecDeque::new(),
                status: RepoStatus {
                    has_remote_changes: false,
                    has_local_changes: true,
                },
                calls: Vec::new(),
                delay: None,
                fail_prepare: None,
            }),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the outcome of the next unanswered pull.
    pub fn queue_pull(&self, outcome: VcsOutcome) -> &Self {
        self.script().pulls.push_back(outcome);
        self
    }

    /// Queue the outcome of the next unanswered push.
    pub fn queue_push(&self, outcome: VcsOutcome) -> &Self {
        self.script().pushes.push_back(outcome);
        self
    }

    pub fn set_status(&self, status: RepoStatus) -> &Self {
        self.script().status = status;
        self
    }

    /// Make every pull and push take at least `delay`.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        self.script().delay = Some(delay);
        self
    }

    pub fn fail_prepare(&self, reason: impl Into<String>) -> &Self {
        self.script().fail_prepare = Some(reason.into());
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<VcsCall> {
        self.script().calls.clone()
    }

    pub fn count(&self, call: VcsCall) -> usize {
        self.script().calls.iter().filter(|c| **c == call).count()
    }

    /// Largest number of pull/push operations observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn operate(&self, call: VcsCall) -> VcsOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let (delay, outcome) = {
            let mut script = self.script();
            script.calls.push(call);
            let outcome = match call {
                VcsCall::Pull => script
                    .pulls
                    .pop_front()
                    .unwrap_or(VcsOutcome::Success { changed: false }),
                _ => script
                    .pushes
                    .pop_front()
                    .unwrap_or(VcsOutcome::Success { changed: true }),
            };
            (script.delay, outcome)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl VersionControlClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn prepare(&self) -> Result<()> {
        let mut script = self.script();
        script.calls.push(VcsCall::Prepare);
        match &script.fail_prepare {
            Some(reason) => Err(Error::Transport(reason.clone())),
            None => Ok(()),
        }
    }

    async fn pull(&self) -> VcsOutcome {
        self.operate(VcsCall::Pull).await
    }

    async fn push(&self) -> VcsOutcome {
        self.operate(VcsCall::Push).await
    }

    async fn status(&self) -> Result<RepoStatus> {
        let mut script = self.script();
        script.calls.push(VcsCall::Status);
        Ok(script.status)
    }
}
