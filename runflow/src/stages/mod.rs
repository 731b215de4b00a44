//! In-process job tasks.
//!
//! Most stages wrap an external command, but a stage can also wrap a
//! [`JobTask`] that runs inside the scheduler's process. Only the local
//! backend can execute these.

use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;

use crate::core::{JobId, RunId};

/// What a task gets to know about the job it runs for.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The run the job belongs to.
    pub run_id: RunId,
    /// The job being executed.
    pub job: JobId,
    /// One-based attempt number.
    pub attempt: u32,
    /// The job's output directory.
    pub output_dir: PathBuf,
}

/// Trait for work executed in-process by the local backend.
#[async_trait]
pub trait JobTask: Send + Sync + Debug {
    /// Runs the task. An `Err` is reported as an execution failure with the
    /// returned message.
    async fn run(&self, ctx: &JobContext) -> Result<(), String>;
}

/// A simple function-based task.
pub struct FnTask<F>
where
    F: Fn(&JobContext) -> Result<(), String> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnTask<F>
where
    F: Fn(&JobContext) -> Result<(), String> + Send + Sync,
{
    /// Creates a new function-based task.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnTask<F>
where
    F: Fn(&JobContext) -> Result<(), String> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> JobTask for FnTask<F>
where
    F: Fn(&JobContext) -> Result<(), String> + Send + Sync,
{
    async fn run(&self, ctx: &JobContext) -> Result<(), String> {
        (self.func)(ctx)
    }
}

/// A task that does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTask;

#[async_trait]
impl JobTask for NoOpTask {
    async fn run(&self, _ctx: &JobContext) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext {
            run_id: RunId::from_number(1),
            job: JobId::per_sample("molecules", "s1"),
            attempt: 1,
            output_dir: PathBuf::from("/tmp/out"),
        }
    }

    #[tokio::test]
    async fn test_noop_task() {
        assert!(NoOpTask.run(&ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fn_task_sees_context() {
        let task = FnTask::new("check", |ctx: &JobContext| {
            if ctx.job.sample.as_deref() == Some("s1") {
                Ok(())
            } else {
                Err("wrong sample".to_string())
            }
        });
        assert!(task.run(&ctx()).await.is_ok());
        assert!(format!("{task:?}").contains("check"));
    }

    #[tokio::test]
    async fn test_fn_task_failure() {
        let task = FnTask::new("fail", |_: &JobContext| Err("nope".to_string()));
        assert_eq!(task.run(&ctx()).await, Err("nope".to_string()));
    }
}
