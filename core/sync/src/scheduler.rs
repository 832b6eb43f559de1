//! Single-consumer trigger queue with coalescing and debounce.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use vaultsync_common::SyncTrigger;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SyncTrigger>,
    /// Set while the consumer is handling the trigger it last took.
    busy: bool,
    closed: bool,
    last_started: Option<Instant>,
}

/// Ordered queue between trigger producers and the engine.
///
/// Any number of producers may push; exactly one consumer calls
/// [`TriggerQueue::next`]. Rules applied on push:
/// - `ProcessStarted` arriving within the debounce window of the previous
///   accepted one is dropped.
/// - `IntervalElapsed` is dropped when one is already pending.
/// - Everything else, stop requests included, keeps arrival order.
#[derive(Debug)]
pub struct TriggerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    debounce: Duration,
}

impl TriggerQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            debounce,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offer a trigger. Returns whether it was queued.
    pub fn push(&self, trigger: SyncTrigger) -> bool {
        let mut state = self.state();
        if state.closed {
            debug!(%trigger, "Queue closed, dropping trigger");
            return false;
        }

        match trigger {
            SyncTrigger::ProcessStarted => {
                let now = Instant::now();
                if let Some(last) = state.last_started {
                    if now.duration_since(last) < self.debounce {
                        debug!("Debouncing process start");
                        return false;
                    }
                }
                state.last_started = Some(now);
            }
            SyncTrigger::IntervalElapsed => {
                if state.pending.contains(&SyncTrigger::IntervalElapsed) {
                    debug!(busy = state.busy, "Coalescing interval tick");
                    return false;
                }
            }
            _ => {}
        }

        state.pending.push_back(trigger);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for the next trigger. `None` once the queue is closed and drained.
    ///
    /// Calling this marks the previously returned trigger as handled.
    pub async fn next(&self) -> Option<SyncTrigger> {
        loop {
            {
                let mut state = self.state();
                state.busy = false;
                if let Some(trigger) = state.pending.pop_front() {
                    state.busy = true;
                    return Some(trigger);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further triggers and wake the consumer.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Whether the consumer is currently handling a trigger.
    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
