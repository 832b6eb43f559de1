//! Trigger and outcome types exchanged between the engine and its collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a single sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::Pull => write!(f, "pull"),
            SyncDirection::Push => write!(f, "push"),
        }
    }
}

/// Action requested through the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManualAction {
    /// Pull, then run the push sequence.
    Sync,
    /// Finish in-flight work and exit.
    Stop,
}

/// An event that makes the engine consider a sync attempt.
///
/// Triggers are consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    ProcessStarted,
    ProcessStopped,
    IntervalElapsed,
    ManualRequest(ManualAction),
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::ProcessStarted => write!(f, "process-started"),
            SyncTrigger::ProcessStopped => write!(f, "process-stopped"),
            SyncTrigger::IntervalElapsed => write!(f, "interval-elapsed"),
            SyncTrigger::ManualRequest(ManualAction::Sync) => write!(f, "manual-sync"),
            SyncTrigger::ManualRequest(ManualAction::Stop) => write!(f, "manual-stop"),
        }
    }
}

/// Classification of a single version-control operation.
///
/// The engine never looks past this classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsOutcome {
    Success { changed: bool },
    Conflict { details: String },
    TransportFailure { cause: String },
}

/// Local/remote change summary reported by the version-control client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoStatus {
    pub has_remote_changes: bool,
    pub has_local_changes: bool,
}

/// Result of one sync attempt as seen by notifications and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOutcome {
    Success {
        direction: SyncDirection,
        changed: bool,
    },
    Conflict {
        direction: SyncDirection,
        details: String,
    },
    TransportFailure {
        direction: SyncDirection,
        cause: String,
    },
    Skipped {
        reason: String,
    },
}

impl SyncOutcome {
    /// Lift a version-control classification into an attempt outcome.
    pub fn from_vcs(direction: SyncDirection, outcome: VcsOutcome) -> Self {
        match outcome {
            VcsOutcome::Success { changed } => SyncOutcome::Success { direction, changed },
            VcsOutcome::Conflict { details } => SyncOutcome::Conflict { direction, details },
            VcsOutcome::TransportFailure { cause } => {
                SyncOutcome::TransportFailure { direction, cause }
            }
        }
    }

    /// Build a skipped outcome.
    pub fn skipped(reason: impl Into<String>) -> Self {
        SyncOutcome::Skipped {
            reason: reason.into(),
        }
    }

    /// Whether the attempt failed (conflicts included).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Conflict { .. } | SyncOutcome::TransportFailure { .. }
        )
    }

    /// Direction of the attempt, if one was made.
    pub fn direction(&self) -> Option<SyncDirection> {
        match self {
            SyncOutcome::Success { direction, .. }
            | SyncOutcome::Conflict { direction, .. }
            | SyncOutcome::TransportFailure { direction, .. } => Some(*direction),
            SyncOutcome::Skipped { .. } => None,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success {
                direction,
                changed: true,
            } => write!(f, "{} completed", direction),
            SyncOutcome::Success {
                direction,
                changed: false,
            } => write!(f, "{} completed, nothing to do", direction),
            SyncOutcome::Conflict { direction, details } => {
                write!(f, "{} needs manual resolution: {}", direction, details)
            }
            SyncOutcome::TransportFailure { direction, cause } => {
                write!(f, "{} failed: {}", direction, cause)
            }
            SyncOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vcs_keeps_classification() {
        let outcome = SyncOutcome::from_vcs(
            SyncDirection::Push,
            VcsOutcome::Conflict {
                details: "rejected".into(),
            },
        );
        assert!(outcome.is_failure());
        assert_eq!(outcome.direction(), Some(SyncDirection::Push));

        let outcome = SyncOutcome::from_vcs(SyncDirection::Pull, VcsOutcome::Success { changed: false });
        assert!(!outcome.is_failure());
    }

    #[test]
    fn test_skipped_has_no_direction() {
        let outcome = SyncOutcome::skipped("not applicable");
        assert_eq!(outcome.direction(), None);
        assert!(!outcome.is_failure());
        assert_eq!(outcome.to_string(), "skipped: not applicable");
    }

    #[test]
    fn test_outcome_serializes_with_kind_tag() {
        let outcome = SyncOutcome::Success {
            direction: SyncDirection::Pull,
            changed: true,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "success");
        assert_eq!(json["direction"], "pull");
    }
}
