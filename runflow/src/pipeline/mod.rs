//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage definitions and the job graph builder
//! - The job graph arena
//! - Concurrency limiting and retry policies
//! - The scheduler loop and the pipeline runner
//! - Post-exit output validation
//! - The run report

mod builder;
mod graph;
mod limiter;
mod report;
mod retry;
mod runner;
mod scheduler;
mod spec;
mod validation;


pub use builder::JobGraphBuilder;
pub use graph::{Job, JobGraph};
pub use limiter::{ConcurrencyLimiter, LimiterConfig};
pub use report::{JobReport, RunOutcome, RunReport};
pub use retry::{decide, BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy};
pub use runner::PipelineRunner;
pub use scheduler::Scheduler;
pub use spec::{CommandSpec, Executable, StageDefinition, StageScope};
pub use validation::{ExpectedOutputs, FnValidator, OutputValidator, COMPLETION_SENTINEL};
