//! Single entry point for executing one run.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

use super::{JobGraphBuilder, RunReport, Scheduler, StageDefinition};
use crate::backend::{create_backend, ExecutionBackend};
use crate::cancellation::CancellationToken;
use crate::config::RunConfig;
use crate::errors::RunflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::rundir::{FsRunDirectoryManager, RunDirectoryManager};

/// Builds the job graph, reserves output directories, and drives the
/// scheduler for one run.
///
/// Graph and directory problems are reported before anything is submitted.
///
/// # Example
///
/// ```no_run
/// use runflow::prelude::*;
///
/// # async fn example() -> Result<(), RunflowError> {
/// let report = PipelineRunner::new(RunConfig::new(RunId::from_number(1), "/scratch/sim"))
///     .stage(StageDefinition::per_run("genome_index", CommandSpec::new("build_index.sh")))
///     .stage(
///         StageDefinition::per_sample("reads", CommandSpec::new("simulate_reads.sh"))
///             .with_dependency("genome_index"),
///     )
///     .samples(["s1", "s2"])
///     .run()
///     .await?;
/// println!("run {} {}", report.run_id, report.outcome);
/// # Ok(())
/// # }
/// ```
pub struct PipelineRunner {
    config: RunConfig,
    stages: Vec<StageDefinition>,
    samples: Vec<String>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    run_dirs: Option<Arc<dyn RunDirectoryManager>>,
    events: Arc<dyn EventSink>,
    token: Arc<CancellationToken>,
}

impl fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("config", &self.config)
            .field("stages", &self.stages.len())
            .field("samples", &self.samples)
            .field("backend", &self.backend)
            .field("run_dirs", &self.run_dirs)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Creates a runner for `config`.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            samples: Vec::new(),
            backend: None,
            run_dirs: None,
            events: Arc::new(NoOpEventSink),
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds several stages.
    #[must_use]
    pub fn stages(mut self, stages: impl IntoIterator<Item = StageDefinition>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Adds a sample.
    #[must_use]
    pub fn sample(mut self, sample: impl Into<String>) -> Self {
        self.samples.push(sample.into());
        self
    }

    /// Adds several samples.
    #[must_use]
    pub fn samples(mut self, samples: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.samples.extend(samples.into_iter().map(Into::into));
        self
    }

    /// Uses `backend` instead of the one selected by the configuration.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses `run_dirs` instead of a filesystem manager at the output root.
    #[must_use]
    pub fn with_run_directories(mut self, run_dirs: Arc<dyn RunDirectoryManager>) -> Self {
        self.run_dirs = Some(run_dirs);
        self
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

    /// Returns the token that aborts this run.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.token)
    }

    /// Executes the run and returns its report.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the stages do not
    /// form a valid graph, the run directory collides with an earlier run,
    /// or the scheduler reaches an inconsistent state. In the first three
    /// cases nothing has been submitted.
    pub async fn run(self) -> Result<RunReport, RunflowError> {
        self.config.validate()?;
        let run_id = self.config.run_id.clone();

        let mut graph = JobGraphBuilder::new(run_id.clone())
            .stages(self.stages)
            .samples(self.samples)
            .build()
            .inspect_err(|e| error!(run_id = %run_id, error = %e, "invalid job graph"))?;

        let run_dirs = self.run_dirs.unwrap_or_else(|| {
            Arc::new(
                FsRunDirectoryManager::new(&self.config.output_root).with_reuse(self.config.reuse),
            )
        });
        for job in graph.jobs_mut() {
            let dir = run_dirs.allocate(&run_id, job.id())?;
            job.output_dir = Some(dir);
        }

        let backend = self
            .backend
            .unwrap_or_else(|| create_backend(&self.config.backend));
        let mode = backend.mode();
        info!(run_id = %run_id, backend = %mode, jobs = graph.len(), "starting run");

        let started_at = Utc::now();
        let mut scheduler = Scheduler::new(graph, backend, self.config.scheduler)
            .with_event_sink(self.events)
            .with_cancellation_token(self.token);
        let outcome = scheduler.run().await?;
        let finished_at = Utc::now();

        Ok(RunReport::from_graph(
            scheduler.graph(),
            mode,
            started_at,
            finished_at,
            outcome,
        ))
    }
}
