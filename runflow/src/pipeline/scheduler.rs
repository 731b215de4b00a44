//! The coordinating loop of a run.
//!
//! One loop owns the [`JobGraph`] and is the only writer of job state. Each
//! pass promotes ready jobs, submits what the limiter admits, polls every
//! outstanding handle with one batched query, enforces time limits, and
//! then sleeps for the poll interval (waking early on cancellation). The
//! loop never waits for an individual job to finish.

use chrono::Utc;
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::retry::{decide, RetryDecision};
use super::{ConcurrencyLimiter, Job, JobGraph, RunOutcome};
use crate::backend::{BackendHandle, BackendStatus, ExecutionBackend, JobRequest};
use crate::cancellation::CancellationToken;
use crate::config::SchedulerConfig;
use crate::core::{JobId, JobState};
use crate::errors::{BackendError, FailureReason, RunflowError};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::observability::{job_span, run_span, SpanTimer};

/// Drives one job graph to completion on one backend.
pub struct Scheduler {
    graph: JobGraph,
    backend: Arc<dyn ExecutionBackend>,
    limiter: ConcurrencyLimiter,
    config: SchedulerConfig,
    events: Arc<dyn EventSink>,
    token: Arc<CancellationToken>,
    next_ready_seq: u64,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_id", self.graph.run_id())
            .field("backend", &self.backend.mode())
            .field("jobs", &self.graph.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler. Every job must already have an output directory.
    #[must_use]
    pub fn new(graph: JobGraph, backend: Arc<dyn ExecutionBackend>, config: SchedulerConfig) -> Self {
        Self {
            limiter: ConcurrencyLimiter::new(config.limits.clone()),
            graph,
            backend,
            config,
            events: Arc::new(NoOpEventSink),
            token: Arc::new(CancellationToken::new()),
            next_ready_seq: 0,
        }
    }

    /// Sets the sink that receives lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses `token` to abort the run.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Returns the graph in its current state.
    #[must_use]
    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Consumes the scheduler, returning the graph.
    #[must_use]
    pub fn into_graph(self) -> JobGraph {
        self.graph
    }

    /// Returns the limiter gating submissions.
    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Returns the token that aborts this run.
    #[must_use]
    pub fn cancellation_token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Runs until every job is `Succeeded` or `Skipped`.
    ///
    /// Job failures are not errors; they are reflected in the outcome and in
    /// each job's failure reason.
    ///
    /// # Errors
    ///
    /// Returns an error only if the scheduler itself reaches an inconsistent
    /// state, such as an illegal job transition.
    pub async fn run(&mut self) -> Result<RunOutcome, RunflowError> {
        let span = run_span(self.graph.run_id(), self.backend.mode());
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> Result<RunOutcome, RunflowError> {
        let timer = SpanTimer::start("run");
        info!(jobs = self.graph.len(), "run started");
        self.events.emit(
            events::RUN_STARTED,
            Some(json!({
                "run_id": self.graph.run_id().to_string(),
                "backend": self.backend.mode().to_string(),
                "jobs": self.graph.len(),
            })),
        );

        loop {
            if self.token.is_cancelled() {
                let reason = self.token.reason().unwrap_or_else(|| "cancelled".to_string());
                return self.abort(reason).await;
            }

            self.promote_ready()?;
            self.submit_admitted().await?;
            self.poll_outstanding().await?;
            self.enforce_timeouts().await?;

            if self.graph.is_resolved() {
                break;
            }
            if self.token.is_cancelled() {
                continue;
            }

            let wait = self.next_wakeup();
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = self.token.cancelled() => {}
            }
        }

        let skipped = self.graph.count_in(JobState::Skipped);
        let outcome = if skipped == 0 {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };
        info!(
            outcome = %outcome,
            succeeded = self.graph.count_in(JobState::Succeeded),
            skipped,
            duration_ms = timer.elapsed_ms(),
            "run completed"
        );
        self.events.emit(
            events::RUN_COMPLETED,
            Some(json!({ "outcome": outcome.to_string(), "skipped": skipped })),
        );
        Ok(outcome)
    }

    fn job(&self, id: &JobId) -> Result<&Job, RunflowError> {
        self.graph
            .get(id)
            .ok_or_else(|| RunflowError::Internal(format!("job '{id}' is not in the graph")))
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job, RunflowError> {
        self.graph
            .get_mut(id)
            .ok_or_else(|| RunflowError::Internal(format!("job '{id}' is not in the graph")))
    }

    fn release_slot(&self, id: &JobId) -> Result<(), RunflowError> {
        let class = &self.job(id)?.stage().resource_class;
        self.limiter.release(class);
        Ok(())
    }

    /// Handles of every job a backend is responsible for.
    fn outstanding(&self) -> Vec<(JobId, BackendHandle)> {
        self.graph
            .jobs()
            .filter(|job| job.state().is_in_flight())
            .filter_map(|job| job.handle().map(|h| (job.id().clone(), h.clone())))
            .collect()
    }

    /// Jobs that become ready in the same pass are sequenced by `JobId`.
    fn promote_ready(&mut self) -> Result<(), RunflowError> {
        let now = Instant::now();
        let mut promotable: Vec<JobId> = self
            .graph
            .topological_order()
            .iter()
            .filter(|id| {
                self.graph.get(id).is_some_and(|job| match job.state() {
                    JobState::Pending => self.graph.dependencies_satisfied(id),
                    JobState::RetryPending => job.retry_at.map_or(true, |at| at <= now),
                    _ => false,
                })
            })
            .cloned()
            .collect();
        promotable.sort();

        for id in promotable {
            let seq = self.next_ready_seq;
            self.next_ready_seq += 1;

            let job = self.job_mut(&id)?;
            job.transition(JobState::Ready)?;
            job.ready_seq = Some(seq);
            job.retry_at = None;

            debug!(job = %id, "job ready");
            self.events
                .emit(events::JOB_READY, Some(json!({ "job": id.to_string() })));
        }
        Ok(())
    }

    /// Offers ready jobs to the limiter in the order they became ready.
    async fn submit_admitted(&mut self) -> Result<(), RunflowError> {
        let mut ready: Vec<(u64, JobId)> = self
            .graph
            .jobs()
            .filter(|job| job.state() == JobState::Ready)
            .map(|job| (job.ready_seq.unwrap_or(u64::MAX), job.id().clone()))
            .collect();
        ready.sort();

        for (_, id) in ready {
            // A permanent failure under fail-fast cancels mid-pass.
            if self.token.is_cancelled() {
                break;
            }
            let class = self.job(&id)?.stage().resource_class.clone();
            if self.limiter.try_admit(&class) {
                self.submit(&id).await?;
            } else {
                debug!(job = %id, class = %class, "no headroom");
            }
        }
        Ok(())
    }

    async fn submit(&mut self, id: &JobId) -> Result<(), RunflowError> {
        let request = {
            let job = self.job(id)?;
            let output_dir = job.output_dir().map(PathBuf::from).ok_or_else(|| {
                RunflowError::Internal(format!("job '{id}' has no output directory"))
            })?;
            JobRequest::for_job(self.graph.run_id(), job, output_dir)
        };
        {
            let job = self.job_mut(id)?;
            job.attempts = request.attempt;
            job.handle = None;
            job.first_submitted_at.get_or_insert_with(Utc::now);
        }

        let backend = Arc::clone(&self.backend);
        let submitted = backend
            .submit(&request)
            .instrument(job_span(id, request.attempt))
            .await;

        match submitted {
            Ok(handle) => {
                let job = self.job_mut(id)?;
                job.transition(JobState::Submitted)?;
                job.handle = Some(handle.clone());
                job.submitted_at = Some(Instant::now());
                job.poll_failures = 0;

                info!(job = %id, handle = %handle, attempt = request.attempt, "job submitted");
                self.events.emit(
                    events::JOB_SUBMITTED,
                    Some(json!({
                        "job": id.to_string(),
                        "handle": handle.to_string(),
                        "attempt": request.attempt,
                    })),
                );
            }
            Err(e) => {
                warn!(job = %id, attempt = request.attempt, error = %e, "submission rejected");
                self.limiter.release(&request.resource_class);
                self.record_failure(id, FailureReason::Submission { message: e.message })?;
            }
        }
        Ok(())
    }

    async fn poll_outstanding(&mut self) -> Result<(), RunflowError> {
        let outstanding = self.outstanding();
        if outstanding.is_empty() {
            return Ok(());
        }

        let handles: Vec<BackendHandle> = outstanding.iter().map(|(_, h)| h.clone()).collect();
        let mut statuses = self.backend.poll_many(&handles).await;

        for (id, handle) in outstanding {
            let status = statuses
                .remove(&handle)
                .unwrap_or_else(|| Err(BackendError::new(handle.id.clone(), "no status reported")));
            match status {
                Ok(status) => self.apply_status(&id, status)?,
                Err(e) => self.record_poll_failure(&id, &handle, e.message).await?,
            }
        }
        Ok(())
    }

    fn apply_status(&mut self, id: &JobId, status: BackendStatus) -> Result<(), RunflowError> {
        let job = self.job_mut(id)?;
        job.poll_failures = 0;
        let state = job.state();

        match status {
            BackendStatus::Queued => {}
            BackendStatus::Running => {
                if state == JobState::Submitted {
                    job.transition(JobState::Running)?;
                    debug!(job = %id, "job running");
                    self.events
                        .emit(events::JOB_RUNNING, Some(json!({ "job": id.to_string() })));
                }
            }
            BackendStatus::Succeeded => {
                self.release_slot(id)?;
                self.finish_succeeded(id)?;
            }
            BackendStatus::Failed { exit_code, message } => {
                self.release_slot(id)?;
                self.record_failure(id, FailureReason::Execution { exit_code, message })?;
            }
        }
        Ok(())
    }

    /// Applies the stage's output check, if any, to a job the backend
    /// reported as succeeded.
    fn finish_succeeded(&mut self, id: &JobId) -> Result<(), RunflowError> {
        let verdict = {
            let job = self.job(id)?;
            match (&job.stage().output_validator, job.output_dir()) {
                (Some(validator), Some(dir)) => validator.validate(id, dir),
                _ => Ok(()),
            }
        };
        match verdict {
            Ok(()) => self.mark_succeeded(id),
            Err(message) => {
                warn!(job = %id, error = %message, "output check failed");
                self.record_failure(id, FailureReason::InvalidOutput { message })
            }
        }
    }

    fn mark_succeeded(&mut self, id: &JobId) -> Result<(), RunflowError> {
        let job = self.job_mut(id)?;
        job.transition(JobState::Succeeded)?;
        job.failure = None;
        job.submitted_at = None;
        let attempts = job.attempts();

        info!(job = %id, attempts, "job succeeded");
        self.events.emit(
            events::JOB_SUCCEEDED,
            Some(json!({ "job": id.to_string(), "attempts": attempts })),
        );
        Ok(())
    }

    async fn record_poll_failure(
        &mut self,
        id: &JobId,
        handle: &BackendHandle,
        message: String,
    ) -> Result<(), RunflowError> {
        let failures = {
            let job = self.job_mut(id)?;
            job.poll_failures += 1;
            job.poll_failures
        };
        warn!(job = %id, handle = %handle, failures, error = %message, "status query failed");

        if failures > self.config.max_poll_failures {
            self.backend.cancel(handle).await;
            self.release_slot(id)?;
            self.record_failure(id, FailureReason::Lost { message })?;
        }
        Ok(())
    }

    async fn enforce_timeouts(&mut self) -> Result<(), RunflowError> {
        let now = Instant::now();
        let expired: Vec<(JobId, BackendHandle, Duration)> = self
            .graph
            .jobs()
            .filter(|job| job.state().is_in_flight())
            .filter_map(|job| {
                let limit = job.stage().timeout?;
                let since = job.submitted_at?;
                let handle = job.handle()?;
                (now.duration_since(since) >= limit).then(|| (job.id().clone(), handle.clone(), limit))
            })
            .collect();

        for (id, handle, limit) in expired {
            let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            warn!(job = %id, handle = %handle, limit_ms, "job exceeded its time limit");
            self.backend.cancel(&handle).await;
            self.release_slot(&id)?;
            self.record_failure(&id, FailureReason::Timeout { limit_ms })?;
        }
        Ok(())
    }

    /// Moves a job to `Failed` and lets its retry policy decide what's next.
    fn record_failure(&mut self, id: &JobId, reason: FailureReason) -> Result<(), RunflowError> {
        let (decision, attempt) = {
            let job = self.job_mut(id)?;
            job.transition(JobState::Failed)?;
            job.failure = Some(reason.clone());
            job.submitted_at = None;
            (decide(&job.stage().retry, job.retries_used), job.attempts())
        };

        warn!(job = %id, attempt, reason = %reason, "job attempt failed");
        self.events.emit(
            events::JOB_FAILED,
            Some(json!({
                "job": id.to_string(),
                "attempt": attempt,
                "reason": reason.to_string(),
            })),
        );

        match decision {
            RetryDecision::Retry(delay) => {
                let job = self.job_mut(id)?;
                job.retries_used += 1;
                job.transition(JobState::RetryPending)?;
                job.retry_at = Some(Instant::now() + delay);
                let retry = job.retries_used;

                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(job = %id, retry, delay_ms, "retry scheduled");
                self.events.emit(
                    events::JOB_RETRY_SCHEDULED,
                    Some(json!({ "job": id.to_string(), "retry": retry, "delay_ms": delay_ms })),
                );
            }
            RetryDecision::GiveUp => {
                self.job_mut(id)?.transition(JobState::Skipped)?;
                error!(job = %id, attempts = attempt, reason = %reason, "job failed permanently");
                self.events.emit(
                    events::JOB_SKIPPED,
                    Some(json!({ "job": id.to_string(), "reason": reason.to_string() })),
                );
                self.skip_dependents(id)?;

                if self.config.fail_fast {
                    self.token.cancel(format!("job '{id}' failed"));
                }
            }
        }
        Ok(())
    }

    fn skip_dependents(&mut self, origin: &JobId) -> Result<(), RunflowError> {
        for id in self.graph.transitive_dependents(origin) {
            let job = self.job_mut(&id)?;
            if job.state().is_terminal() {
                continue;
            }
            let reason = FailureReason::UpstreamFailed {
                origin: origin.clone(),
            };
            job.failure = Some(reason.clone());
            job.transition(JobState::Skipped)?;

            info!(job = %id, origin = %origin, "job skipped");
            self.events.emit(
                events::JOB_SKIPPED,
                Some(json!({ "job": id.to_string(), "reason": reason.to_string() })),
            );
        }
        Ok(())
    }

    /// Cancels outstanding work, waits for the backend to confirm, and skips
    /// every unresolved job.
    async fn abort(&mut self, reason: String) -> Result<RunOutcome, RunflowError> {
        warn!(reason = %reason, "aborting run");
        for job in self.graph.jobs_mut() {
            if !job.state().is_terminal() {
                job.cancel_requested = true;
            }
        }

        let mut remaining = self.outstanding();
        for (id, handle) in &remaining {
            debug!(job = %id, handle = %handle, "cancelling");
            self.backend.cancel(handle).await;
        }

        let deadline = Instant::now() + self.config.cancel_timeout();
        while !remaining.is_empty() {
            let handles: Vec<BackendHandle> = remaining.iter().map(|(_, h)| h.clone()).collect();
            let statuses = self.backend.poll_many(&handles).await;

            let mut unconfirmed = Vec::new();
            for (id, handle) in remaining {
                match statuses.get(&handle) {
                    Some(Ok(BackendStatus::Succeeded)) => {
                        self.release_slot(&id)?;
                        self.finish_succeeded(&id)?;
                    }
                    Some(Ok(status)) if status.is_terminal() => {}
                    _ => unconfirmed.push((id, handle)),
                }
            }
            remaining = unconfirmed;
            if remaining.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    outstanding = remaining.len(),
                    "backend did not confirm cancellation before the timeout"
                );
                break;
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }

        let unresolved: Vec<JobId> = self
            .graph
            .jobs()
            .filter(|job| !job.state().is_terminal())
            .map(|job| job.id().clone())
            .collect();
        for id in &unresolved {
            if self.job(id)?.state().is_in_flight() {
                self.release_slot(id)?;
            }
            let cancelled = FailureReason::Cancelled {
                reason: reason.clone(),
            };
            let job = self.job_mut(id)?;
            job.failure = Some(cancelled);
            job.transition(JobState::Skipped)?;
            self.events.emit(
                events::JOB_SKIPPED,
                Some(json!({ "job": id.to_string(), "reason": format!("cancelled: {reason}") })),
            );
        }

        warn!(skipped = unresolved.len(), reason = %reason, "run aborted");
        self.events.emit(
            events::RUN_ABORTED,
            Some(json!({ "reason": reason, "skipped": unresolved.len() })),
        );
        Ok(RunOutcome::Aborted)
    }

    /// Sleeps at most one poll interval, less if a retry comes due sooner.
    fn next_wakeup(&self) -> Duration {
        let interval = self.config.poll_interval();
        let now = Instant::now();
        self.graph
            .jobs()
            .filter(|job| job.state() == JobState::RetryPending)
            .filter_map(|job| job.retry_at)
            .map(|at| at.saturating_duration_since(now))
            .min()
            .map_or(interval, |due| due.min(interval))
    }
}
