//! The job arena for one run.
//!
//! Jobs are stored by [`JobId`]; edges are sets of ids rather than
//! references, so the graph never owns itself cyclically.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::StageDefinition;
use crate::backend::BackendHandle;
use crate::core::{JobId, JobState, RunId};
use crate::errors::{
    CycleDetectedError, ErrorInfo, FailureReason, GraphConfigurationError, InvalidTransitionError,
};

/// A stage bound to a sample (or to the whole run).
#[derive(Debug)]
pub struct Job {
    id: JobId,
    stage: Arc<StageDefinition>,
    dependencies: BTreeSet<JobId>,
    state: JobState,
    pub(crate) retries_used: u32,
    pub(crate) attempts: u32,
    pub(crate) handle: Option<BackendHandle>,
    pub(crate) output_dir: Option<PathBuf>,
    pub(crate) failure: Option<FailureReason>,
    pub(crate) ready_seq: Option<u64>,
    pub(crate) submitted_at: Option<Instant>,
    pub(crate) retry_at: Option<Instant>,
    pub(crate) cancel_requested: bool,
    pub(crate) poll_failures: u32,
    pub(crate) first_submitted_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub fn new(id: JobId, stage: Arc<StageDefinition>, dependencies: BTreeSet<JobId>) -> Self {
        Self {
            id,
            stage,
            dependencies,
            state: JobState::Pending,
            retries_used: 0,
            attempts: 0,
            handle: None,
            output_dir: None,
            failure: None,
            ready_seq: None,
            submitted_at: None,
            retry_at: None,
            cancel_requested: false,
            poll_failures: 0,
            first_submitted_at: None,
            finished_at: None,
        }
    }

    /// Returns the job's identity.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the stage this job instantiates.
    #[must_use]
    pub fn stage(&self) -> &Arc<StageDefinition> {
        &self.stage
    }

    /// Returns the ids of the jobs this job waits for.
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<JobId> {
        &self.dependencies
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Returns the number of retries used so far.
    #[must_use]
    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Returns the number of submission attempts so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the backend handle of the current attempt.
    #[must_use]
    pub fn handle(&self) -> Option<&BackendHandle> {
        self.handle.as_ref()
    }

    /// Returns the output directory, once allocated.
    #[must_use]
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Returns the failure reason, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// Returns true if an abort asked for this job to be cancelled.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Moves the job to `next`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state machine does not allow the transition.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransitionError {
                job: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.retry_at = None;
        }
        Ok(())
    }
}

/// All jobs of one run plus their dependency edges.
#[derive(Debug)]
pub struct JobGraph {
    run_id: RunId,
    jobs: BTreeMap<JobId, Job>,
    dependents: BTreeMap<JobId, BTreeSet<JobId>>,
    topo_order: Vec<JobId>,
}

impl JobGraph {
    /// Assembles a graph, checking that every edge resolves and that there
    /// is no cycle.
    ///
    /// # Errors
    ///
    /// Returns an error on a dangling edge or a cycle.
    pub fn new(run_id: RunId, jobs: BTreeMap<JobId, Job>) -> Result<Self, GraphConfigurationError> {
        let mut dependents: BTreeMap<JobId, BTreeSet<JobId>> =
            jobs.keys().map(|id| (id.clone(), BTreeSet::new())).collect();

        for job in jobs.values() {
            for dep in job.dependencies() {
                let Some(children) = dependents.get_mut(dep) else {
                    return Err(GraphConfigurationError::new(format!(
                        "Job '{}' depends on unknown job '{}'",
                        job.id(),
                        dep
                    ))
                    .with_stages(vec![job.id().stage.clone(), dep.stage.clone()])
                    .with_error_info(ErrorInfo::new(
                        "GRAPH-DANGLING_EDGE",
                        format!("Dependency '{dep}' does not resolve to a job in this run"),
                    )));
                };
                children.insert(job.id().clone());
            }
        }

        let topo_order = topological_order(&jobs, &dependents)?;

        Ok(Self {
            run_id,
            jobs,
            dependents,
            topo_order,
        })
    }

    /// Returns the run this graph belongs to.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Returns the number of jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the graph has no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Looks up a job.
    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Iterates over jobs in id order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub(crate) fn jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    /// Returns the jobs that directly depend on `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &JobId) -> Option<&BTreeSet<JobId>> {
        self.dependents.get(id)
    }

    /// Returns every job downstream of `id`, in id order.
    #[must_use]
    pub fn transitive_dependents(&self, id: &JobId) -> Vec<JobId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&JobId> = self.dependents.get(id).into_iter().flatten().collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents.get(next).into_iter().flatten());
            }
        }
        seen.into_iter().collect()
    }

    /// Returns a dependency-respecting order of all jobs.
    #[must_use]
    pub fn topological_order(&self) -> &[JobId] {
        &self.topo_order
    }

    /// Returns true if every dependency of `id` has succeeded.
    #[must_use]
    pub fn dependencies_satisfied(&self, id: &JobId) -> bool {
        self.jobs.get(id).is_some_and(|job| {
            job.dependencies()
                .iter()
                .all(|dep| self.jobs.get(dep).is_some_and(|d| d.state() == JobState::Succeeded))
        })
    }

    /// Returns the number of jobs in `state`.
    #[must_use]
    pub fn count_in(&self, state: JobState) -> usize {
        self.jobs.values().filter(|job| job.state() == state).count()
    }

    /// Returns true once every job reached a terminal state.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.jobs.values().all(|job| job.state().is_terminal())
    }
}

fn topological_order(
    jobs: &BTreeMap<JobId, Job>,
    dependents: &BTreeMap<JobId, BTreeSet<JobId>>,
) -> Result<Vec<JobId>, CycleDetectedError> {
    let mut in_degree: BTreeMap<&JobId, usize> =
        jobs.iter().map(|(id, job)| (id, job.dependencies().len())).collect();
    let mut ready: BTreeSet<&JobId> = in_degree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(jobs.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.clone());
        for child in dependents.get(id).into_iter().flatten() {
            if let Some(count) = in_degree.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() == jobs.len() {
        return Ok(order);
    }

    let placed: BTreeSet<&JobId> = order.iter().collect();
    Err(CycleDetectedError::new(find_cycle(jobs, &placed)))
}

/// Walks dependency edges among the unplaced jobs until one repeats.
fn find_cycle(jobs: &BTreeMap<JobId, Job>, placed: &BTreeSet<&JobId>) -> Vec<String> {
    let Some(start) = jobs.keys().find(|id| !placed.contains(id)) else {
        return Vec::new();
    };
    let mut path: Vec<&JobId> = vec![start];
    let mut current = start;

    loop {
        let next = jobs
            .get(current)
            .and_then(|job| job.dependencies().iter().find(|dep| !placed.contains(dep)));
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|id| *id == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.iter().map(ToString::to_string).collect()
}
