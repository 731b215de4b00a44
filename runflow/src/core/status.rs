//! Job state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// At least one dependency has not succeeded yet.
    #[default]
    Pending,
    /// All dependencies succeeded; waiting for the concurrency limiter.
    Ready,
    /// Handed to a backend, waiting for it to start.
    Submitted,
    /// The backend reports the job as executing.
    Running,
    /// Terminal success.
    Succeeded,
    /// The last attempt failed; the retry policy decides what happens next.
    Failed,
    /// Waiting out the backoff delay before the next attempt.
    RetryPending,
    /// Terminal; the job will never run (again).
    Skipped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RetryPending => "retry_pending",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl JobState {
    /// Returns true if the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Returns true if a backend is currently responsible for the job.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use JobState::{Failed, Pending, Ready, RetryPending, Running, Skipped, Submitted, Succeeded};

        match (self, next) {
            (Pending, Ready | Skipped)
            | (Ready, Submitted | Failed | Skipped)
            | (Submitted, Running | Succeeded | Failed | Skipped)
            | (Running, Succeeded | Failed | Skipped)
            | (Failed, RetryPending | Skipped)
            | (RetryPending, Ready | Skipped) => true,
            _ => false,
        }
    }
}
