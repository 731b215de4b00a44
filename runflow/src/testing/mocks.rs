//! Scripted backend for exercising the scheduler without real processes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::backend::{BackendHandle, BackendMode, BackendStatus, ExecutionBackend, JobRequest};
use crate::core::JobId;
use crate::errors::{BackendError, SubmissionError};

/// What a scripted submission does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Runs, then succeeds.
    Succeed,
    /// Runs, then fails with the exit code.
    Fail(i32),
    /// Rejected at submit time.
    RejectSubmit(String),
    /// Runs until cancelled.
    Hang,
    /// Accepted, but every status query fails.
    PollError,
}

#[derive(Debug)]
struct Submission {
    outcome: ScriptedOutcome,
    polls: u32,
    cancelled: bool,
    finished: Option<BackendStatus>,
}

#[derive(Debug, Default)]
struct ScriptState {
    next_id: u64,
    submissions: HashMap<String, Submission>,
    log: Vec<(JobId, u32)>,
    cancels: Vec<BackendHandle>,
    in_flight: usize,
    max_in_flight: usize,
}

/// A backend whose jobs follow a script keyed by job and attempt.
///
/// Every accepted submission reports `Running` for `running_polls` status
/// queries before its scripted outcome. The backend records every submit
/// and cancel call and the peak number of unfinished submissions.
#[derive(Debug)]
pub struct ScriptedBackend {
    mode: BackendMode,
    default_outcome: ScriptedOutcome,
    scripts: HashMap<(JobId, u32), ScriptedOutcome>,
    running_polls: u32,
    state: Mutex<ScriptState>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Creates a backend where every job succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: BackendMode::Local,
            default_outcome: ScriptedOutcome::Succeed,
            scripts: HashMap::new(),
            running_polls: 1,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Reports itself as `mode`.
    #[must_use]
    pub fn with_mode(mut self, mode: BackendMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the outcome of jobs without a script entry.
    #[must_use]
    pub fn with_default(mut self, outcome: ScriptedOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Scripts one attempt (one-based) of one job.
    #[must_use]
    pub fn with_outcome(mut self, job: JobId, attempt: u32, outcome: ScriptedOutcome) -> Self {
        self.scripts.insert((job, attempt), outcome);
        self
    }

    /// Sets how many status queries report `Running` before the outcome.
    #[must_use]
    pub fn with_running_polls(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    /// Returns every submit call as (job, attempt), in call order.
    #[must_use]
    pub fn submissions(&self) -> Vec<(JobId, u32)> {
        self.state.lock().log.clone()
    }

    /// Returns the jobs of every submit call, in call order.
    #[must_use]
    pub fn submitted_jobs(&self) -> Vec<JobId> {
        self.state.lock().log.iter().map(|(job, _)| job.clone()).collect()
    }

    /// Returns the number of submit calls for `job`.
    #[must_use]
    pub fn submission_count(&self, job: &JobId) -> usize {
        self.state.lock().log.iter().filter(|(j, _)| j == job).count()
    }

    /// Returns every handle passed to `cancel`.
    #[must_use]
    pub fn cancelled(&self) -> Vec<BackendHandle> {
        self.state.lock().cancels.clone()
    }

    /// Returns the peak number of accepted, unfinished submissions.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    fn outcome_for(&self, job: &JobId, attempt: u32) -> ScriptedOutcome {
        self.scripts
            .get(&(job.clone(), attempt))
            .unwrap_or(&self.default_outcome)
            .clone()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    async fn submit(&self, request: &JobRequest) -> Result<BackendHandle, SubmissionError> {
        let outcome = self.outcome_for(&request.job, request.attempt);
        let mut state = self.state.lock();
        state.log.push((request.job.clone(), request.attempt));

        if let ScriptedOutcome::RejectSubmit(message) = outcome {
            return Err(SubmissionError::new(request.job.clone(), message));
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        state.submissions.insert(
            id.clone(),
            Submission {
                outcome,
                polls: 0,
                cancelled: false,
                finished: None,
            },
        );
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(BackendHandle::new(self.mode, id))
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let running_polls = self.running_polls;
        let mut state = self.state.lock();
        let Some(submission) = state.submissions.get_mut(&handle.id) else {
            return Err(BackendError::new(handle.id.clone(), "unknown handle"));
        };
        if let Some(status) = &submission.finished {
            return Ok(status.clone());
        }
        if submission.outcome == ScriptedOutcome::PollError && !submission.cancelled {
            return Err(BackendError::new(handle.id.clone(), "status query failed"));
        }

        submission.polls += 1;
        let status = if submission.cancelled {
            BackendStatus::failed(None, "cancelled")
        } else if submission.polls <= running_polls || submission.outcome == ScriptedOutcome::Hang {
            BackendStatus::Running
        } else {
            match &submission.outcome {
                ScriptedOutcome::Fail(code) => BackendStatus::failed(Some(*code), "scripted failure"),
                _ => BackendStatus::Succeeded,
            }
        };

        if status.is_terminal() {
            submission.finished = Some(status.clone());
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        Ok(status)
    }

    async fn cancel(&self, handle: &BackendHandle) {
        let mut state = self.state.lock();
        state.cancels.push(handle.clone());
        if let Some(submission) = state.submissions.get_mut(&handle.id) {
            submission.cancelled = true;
        }
    }
}
