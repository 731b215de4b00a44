//! # Runflow
//!
//! Dependency-aware job scheduling for multi-stage simulation pipelines.
//!
//! Runflow models pipeline stages as a dependency graph and drives it to
//! completion on one of several interchangeable execution backends:
//!
//! - **Job graphs**: stages are expanded per sample (or once per run) into a
//!   validated, acyclic graph of jobs
//! - **Backends**: local child processes and in-process tasks, LSF and SGE
//! - **Scheduling**: one coordinating loop with global and per-class
//!   concurrency ceilings, per-job timeouts and retry budgets
//! - **Failure propagation**: a job that fails for good skips everything
//!   downstream of it, while unrelated branches keep running
//! - **Run directories**: numbered runs that never overwrite each other
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use runflow::prelude::*;
//!
//! let report = PipelineRunner::new(RunConfig::new(RunId::from_number(1), "/scratch/sim"))
//!     .stage(StageDefinition::per_run("genome_index", CommandSpec::new("build_index.sh")))
//!     .stage(
//!         StageDefinition::per_sample("reads", CommandSpec::new("simulate_reads.sh"))
//!             .with_dependency("genome_index")
//!             .with_retry(RetryPolicy::new().with_max_retries(2)),
//!     )
//!     .samples(["s1", "s2"])
//!     .run()
//!     .await?;
//!
//! assert!(report.outcome.is_success());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod rundir;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{
        create_backend, BackendConfig, BackendHandle, BackendMode, BackendStatus,
        ExecutionBackend, JobRequest, LocalConfig, LsfConfig, SgeConfig,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{RunConfig, SchedulerConfig};
    pub use crate::core::{JobId, JobState, ResourceClass, ResourceRequest, RunId};
    pub use crate::errors::{
        BackendError, ConfigError, ErrorInfo, FailureReason, GraphConfigurationError,
        RunCollisionError, RunflowError, SubmissionError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        BackoffStrategy, CommandSpec, ExpectedOutputs, JitterStrategy, JobGraph, JobGraphBuilder,
        LimiterConfig, OutputValidator, PipelineRunner, RetryPolicy, RunOutcome, RunReport,
        Scheduler, StageDefinition, StageScope,
    };
    pub use crate::rundir::{FsRunDirectoryManager, RunDirectoryManager};
    pub use crate::stages::{FnTask, JobContext, JobTask};
}
