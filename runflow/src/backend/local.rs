//! Local execution: child processes and in-process tasks.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendHandle, BackendMode, BackendStatus, ExecutionBackend, JobRequest};
use crate::errors::{BackendError, SubmissionError};
use crate::pipeline::Executable;
use crate::stages::JobContext;

/// Settings for the local backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Start children with an empty environment instead of inheriting ours.
    #[serde(default)]
    pub clear_env: bool,
    /// Extra environment variables for every child.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

enum LocalEntry {
    Process(Child),
    Task(JoinHandle<Result<(), String>>),
}

/// Runs jobs on this machine.
///
/// Concurrency is bounded by the scheduler's limiter, not here. A handle is
/// forgotten once a poll has reported its terminal status.
pub struct LocalBackend {
    config: LocalConfig,
    entries: DashMap<String, LocalEntry>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("config", &self.config)
            .field("tracked", &self.entries.len())
            .finish()
    }
}

impl LocalBackend {
    /// Creates a new local backend.
    #[must_use]
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    fn spawn_process(&self, request: &JobRequest) -> Result<LocalEntry, SubmissionError> {
        let Executable::Command(cmd) = &request.executable else {
            return Err(SubmissionError::new(request.job.clone(), "not a command"));
        };
        let submission_err =
            |what: String| SubmissionError::new(request.job.clone(), what);

        let stdout = std::fs::File::create(request.stdout_path()).map_err(|e| {
            submission_err(format!("failed to create `{}`: {e}", request.stdout_path().display()))
        })?;
        let stderr = std::fs::File::create(request.stderr_path()).map_err(|e| {
            submission_err(format!("failed to create `{}`: {e}", request.stderr_path().display()))
        })?;

        let mut command = Command::new(&cmd.program);
        if self.config.clear_env {
            command.env_clear();
        }
        command
            .args(&cmd.args)
            .envs(&self.config.extra_env)
            .envs(request.environment())
            .current_dir(&request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| submission_err(format!("failed to spawn `{}`: {e}", cmd.program)))?;
        Ok(LocalEntry::Process(child))
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Local
    }

    async fn submit(&self, request: &JobRequest) -> Result<BackendHandle, SubmissionError> {
        tokio::fs::create_dir_all(&request.output_dir).await.map_err(|e| {
            SubmissionError::new(
                request.job.clone(),
                format!("failed to create `{}`: {e}", request.output_dir.display()),
            )
        })?;

        let entry = match &request.executable {
            Executable::Command(_) => self.spawn_process(request)?,
            Executable::Task(task) => {
                let task = task.clone();
                let ctx = JobContext {
                    run_id: request.run_id.clone(),
                    job: request.job.clone(),
                    attempt: request.attempt,
                    output_dir: request.output_dir.clone(),
                };
                LocalEntry::Task(tokio::spawn(async move { task.run(&ctx).await }))
            }
        };

        let id = Uuid::now_v7().to_string();
        debug!(job = %request.job, handle = %id, attempt = request.attempt, "started local job");
        self.entries.insert(id.clone(), entry);
        Ok(BackendHandle::new(BackendMode::Local, id))
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let Some(mut entry) = self.entries.get_mut(&handle.id) else {
            return Err(BackendError::new(&handle.id, "unknown local handle"));
        };

        let status = match entry.value_mut() {
            LocalEntry::Process(child) => match child.try_wait() {
                Ok(None) => return Ok(BackendStatus::Running),
                Ok(Some(exit)) if exit.success() => BackendStatus::Succeeded,
                Ok(Some(exit)) => BackendStatus::failed(exit.code(), format!("process {exit}")),
                Err(e) => return Err(BackendError::new(&handle.id, e.to_string())),
            },
            LocalEntry::Task(join) => {
                if !join.is_finished() {
                    return Ok(BackendStatus::Running);
                }
                match join.now_or_never() {
                    None => return Ok(BackendStatus::Running),
                    Some(Ok(Ok(()))) => BackendStatus::Succeeded,
                    Some(Ok(Err(message))) => BackendStatus::failed(None, message),
                    Some(Err(join_error)) => {
                        BackendStatus::failed(None, format!("task did not complete: {join_error}"))
                    }
                }
            }
        };

        drop(entry);
        self.entries.remove(&handle.id);
        debug!(handle = %handle, status = ?status, "local job finished");
        Ok(status)
    }

    async fn cancel(&self, handle: &BackendHandle) {
        let Some(mut entry) = self.entries.get_mut(&handle.id) else {
            return;
        };
        match entry.value_mut() {
            LocalEntry::Process(child) => {
                if let Err(e) = child.start_kill() {
                    warn!(handle = %handle, error = %e, "failed to kill local process");
                }
            }
            LocalEntry::Task(join) => join.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobId, ResourceClass, RunId};
    use crate::pipeline::CommandSpec;
    use crate::stages::{FnTask, NoOpTask};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(executable: Executable, dir: &Path) -> JobRequest {
        JobRequest {
            run_id: RunId::from_number(1),
            job: JobId::run_wide("job"),
            attempt: 1,
            executable,
            resource_class: ResourceClass::default(),
            timeout: None,
            output_dir: dir.to_path_buf(),
        }
    }

    async fn wait_terminal(backend: &LocalBackend, handle: &BackendHandle) -> BackendStatus {
        for _ in 0..500 {
            let status = backend.poll(handle).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_success_writes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(LocalConfig::default());
        let cmd = CommandSpec::new("sh").args(["-c", "echo \"$RUNFLOW_JOB\""]);
        let handle = backend.submit(&request(cmd.into(), dir.path())).await.unwrap();

        assert_eq!(handle.backend, BackendMode::Local);
        assert_eq!(wait_terminal(&backend, &handle).await, BackendStatus::Succeeded);
        let stdout = std::fs::read_to_string(dir.path().join("stdout.log")).unwrap();
        assert_eq!(stdout.trim(), "job");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_failure_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(LocalConfig::default());
        let cmd = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let handle = backend.submit(&request(cmd.into(), dir.path())).await.unwrap();

        match wait_terminal(&backend, &handle).await {
            BackendStatus::Failed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_submission_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(LocalConfig::default());
        let cmd = CommandSpec::new("no-such-program-runflow-test");
        let err = backend.submit(&request(cmd.into(), dir.path())).await.unwrap_err();
        assert!(err.message.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_task_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(LocalConfig::default());

        let ok = backend
            .submit(&request(Executable::Task(Arc::new(NoOpTask)), dir.path()))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&backend, &ok).await, BackendStatus::Succeeded);

        let failing = FnTask::new("fail", |_: &JobContext| Err("bad input".to_string()));
        let bad = backend
            .submit(&request(Executable::Task(Arc::new(failing)), dir.path()))
            .await
            .unwrap();
        assert_eq!(
            wait_terminal(&backend, &bad).await,
            BackendStatus::failed(None, "bad input")
        );
    }

    #[tokio::test]
    async fn test_finished_jobs_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(LocalConfig::default());

        for _ in 0..20 {
            let handle = backend
                .submit(&request(Executable::Task(Arc::new(NoOpTask)), dir.path()))
                .await
                .unwrap();
            assert_eq!(wait_terminal(&backend, &handle).await, BackendStatus::Succeeded);
            assert!(backend.poll(&handle).await.is_err());
            backend.cancel(&handle).await;
        }
        assert!(backend.entries.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(LocalConfig::default());
        let cmd = CommandSpec::new("sleep").arg("30");
        let handle = backend.submit(&request(cmd.into(), dir.path())).await.unwrap();

        assert_eq!(backend.poll(&handle).await.unwrap(), BackendStatus::Running);
        backend.cancel(&handle).await;
        assert!(matches!(wait_terminal(&backend, &handle).await, BackendStatus::Failed { .. }));
        backend.cancel(&handle).await;
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let backend = LocalBackend::new(LocalConfig::default());
        let handle = BackendHandle::new(BackendMode::Local, "nope");
        assert!(backend.poll(&handle).await.is_err());
        backend.cancel(&handle).await;
    }
}
