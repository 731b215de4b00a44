//! Run outcome report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::JobGraph;
use crate::backend::BackendMode;
use crate::core::{JobId, JobState, RunId};
use crate::errors::FailureReason;

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every job succeeded.
    Succeeded,
    /// Every job resolved, but at least one was skipped.
    Failed,
    /// The run was cancelled before every job resolved.
    Aborted,
}

impl RunOutcome {
    /// Returns true only for a fully successful run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final record of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// The job.
    pub job: JobId,
    /// Final state, `Succeeded` or `Skipped` for a resolved run.
    pub state: JobState,
    /// Number of submission attempts.
    pub attempts: u32,
    /// Why the job was skipped, if it was.
    pub failure: Option<FailureReason>,
    /// Where the job wrote its output.
    pub output_dir: Option<PathBuf>,
    /// When the first attempt was submitted.
    pub first_submitted_at: Option<DateTime<Utc>>,
    /// When the job reached its final state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// The run.
    pub run_id: RunId,
    /// The backend that executed it.
    pub backend: BackendMode,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When the last job resolved.
    pub finished_at: DateTime<Utc>,
    /// Overall result.
    pub outcome: RunOutcome,
    /// Every job, in id order.
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    /// Captures the final state of `graph`.
    #[must_use]
    pub fn from_graph(
        graph: &JobGraph,
        backend: BackendMode,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Self {
        let jobs = graph
            .jobs()
            .map(|job| JobReport {
                job: job.id().clone(),
                state: job.state(),
                attempts: job.attempts(),
                failure: job.failure().cloned(),
                output_dir: job.output_dir().map(PathBuf::from),
                first_submitted_at: job.first_submitted_at,
                finished_at: job.finished_at,
            })
            .collect();

        Self {
            run_id: graph.run_id().clone(),
            backend,
            started_at,
            finished_at,
            outcome,
            jobs,
        }
    }

    /// Looks up the record of `job`.
    #[must_use]
    pub fn job(&self, job: &JobId) -> Option<&JobReport> {
        self.jobs.iter().find(|r| &r.job == job)
    }

    /// Returns the jobs where a failure originated (not collateral skips).
    pub fn failed_origins(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs
            .iter()
            .filter(|r| r.failure.as_ref().is_some_and(FailureReason::is_origin))
    }

    /// Returns the number of jobs that ended in `state`.
    #[must_use]
    pub fn count_in(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|r| r.state == state).count()
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Wall-clock duration of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
