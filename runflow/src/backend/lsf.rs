//! IBM Spectrum LSF backend.
//!
//! Each attempt is written to `job.sh` in the job's output directory and
//! submitted with `bsub`. Status for every outstanding job is fetched with a
//! single `bjobs` call per poll.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use super::script::{cluster_job_name, resource_request, write_job_script};
use super::{
    BackendHandle, BackendMode, BackendStatus, CommandRunner, ExecutionBackend, JobRequest,
};
use crate::core::{ResourceClass, ResourceRequest};
use crate::errors::{BackendError, SubmissionError};

#[allow(clippy::expect_used)]
static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <(\d+)> is submitted").expect("valid regex"));

/// Output format handed to `bjobs -o`.
const BJOBS_FORMAT: &str = "jobid stat exit_code delimiter=','";

/// Settings for the LSF backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsfConfig {
    /// Default queue; resource classes may override it.
    #[serde(default)]
    pub queue: Option<String>,
    /// Extra arguments appended to every `bsub` invocation.
    #[serde(default)]
    pub extra_bsub_args: Vec<String>,
    /// Submission command.
    #[serde(default = "default_bsub")]
    pub bsub: String,
    /// Status command.
    #[serde(default = "default_bjobs")]
    pub bjobs: String,
    /// Cancellation command.
    #[serde(default = "default_bkill")]
    pub bkill: String,
}

fn default_bsub() -> String {
    "bsub".to_string()
}

fn default_bjobs() -> String {
    "bjobs".to_string()
}

fn default_bkill() -> String {
    "bkill".to_string()
}

impl Default for LsfConfig {
    fn default() -> Self {
        Self {
            queue: None,
            extra_bsub_args: Vec::new(),
            bsub: default_bsub(),
            bjobs: default_bjobs(),
            bkill: default_bkill(),
        }
    }
}

impl LsfConfig {
    /// Sets the default queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Appends extra `bsub` arguments.
    #[must_use]
    pub fn with_extra_bsub_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_bsub_args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Submits jobs to LSF.
pub struct LsfBackend {
    config: LsfConfig,
    resource_classes: BTreeMap<ResourceClass, ResourceRequest>,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for LsfBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsfBackend")
            .field("config", &self.config)
            .field("resource_classes", &self.resource_classes)
            .finish_non_exhaustive()
    }
}

impl LsfBackend {
    /// Creates a new LSF backend.
    #[must_use]
    pub fn new(
        config: LsfConfig,
        resource_classes: BTreeMap<ResourceClass, ResourceRequest>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            resource_classes,
            runner,
        }
    }

    /// Builds the `bsub` argument list for `request`, ending with the script.
    #[must_use]
    pub fn bsub_args(&self, request: &JobRequest, script: &str) -> Vec<String> {
        let resources = resource_request(&self.resource_classes, request);
        let mut args = vec!["-J".to_string(), cluster_job_name(request)];

        if let Some(queue) = resources.queue.as_ref().or(self.config.queue.as_ref()) {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        args.push("-n".to_string());
        args.push(resources.cpus.to_string());
        args.push("-R".to_string());
        args.push(format!("rusage[mem={}]", resources.memory_mb));
        if let Some(timeout) = request.timeout {
            // -W takes whole minutes.
            let minutes = timeout.as_secs().div_ceil(60).max(1);
            args.push("-W".to_string());
            args.push(minutes.to_string());
        }
        args.push("-o".to_string());
        args.push(request.stdout_path().display().to_string());
        args.push("-e".to_string());
        args.push(request.stderr_path().display().to_string());
        args.extend(self.config.extra_bsub_args.iter().cloned());
        args.push(script.to_string());
        args
    }
}

/// Extracts the job id from `bsub` output.
#[must_use]
pub fn parse_bsub_output(stdout: &str) -> Option<String> {
    SUBMITTED
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Maps an LSF job state and exit code to a backend status.
#[must_use]
pub fn map_lsf_status(stat: &str, exit_code: &str) -> Option<BackendStatus> {
    let status = match stat {
        "PEND" | "PSUSP" | "WAIT" => BackendStatus::Queued,
        "RUN" | "USUSP" | "SSUSP" | "PROV" => BackendStatus::Running,
        "DONE" => BackendStatus::Succeeded,
        "EXIT" | "ZOMBI" | "UNKWN" => BackendStatus::failed(
            exit_code.trim().parse().ok(),
            format!("LSF job state {stat}"),
        ),
        _ => return None,
    };
    Some(status)
}

/// Parses `bjobs -noheader -o "jobid stat exit_code delimiter=','"` output.
#[must_use]
pub fn parse_bjobs_output(stdout: &str) -> HashMap<String, BackendStatus> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split(',');
            let id = fields.next()?.trim();
            let stat = fields.next()?.trim();
            let exit_code = fields.next().unwrap_or("-");
            if id.is_empty() {
                return None;
            }
            map_lsf_status(stat, exit_code).map(|status| (id.to_string(), status))
        })
        .collect()
}

#[async_trait]
impl ExecutionBackend for LsfBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Lsf
    }

    async fn submit(&self, request: &JobRequest) -> Result<BackendHandle, SubmissionError> {
        let script = write_job_script(request).await?;
        let args = self.bsub_args(request, &script.display().to_string());

        let output = self.runner.run(&self.config.bsub, &args).await.map_err(|e| {
            SubmissionError::new(request.job.clone(), format!("failed to run `{}`: {e}", self.config.bsub))
        })?;
        if !output.success() {
            return Err(SubmissionError::new(
                request.job.clone(),
                format!("bsub exited with {:?}: {}", output.status, output.stderr.trim()),
            ));
        }
        let id = parse_bsub_output(&output.stdout).ok_or_else(|| {
            SubmissionError::new(
                request.job.clone(),
                format!("unrecognized bsub output: {}", output.stdout.trim()),
            )
        })?;

        debug!(job = %request.job, lsf_job = %id, attempt = request.attempt, "submitted to LSF");
        Ok(BackendHandle::new(BackendMode::Lsf, id))
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let mut statuses = self.poll_many(std::slice::from_ref(handle)).await;
        statuses
            .remove(handle)
            .unwrap_or_else(|| Err(BackendError::new(&handle.id, "no status returned")))
    }

    async fn poll_many(
        &self,
        handles: &[BackendHandle],
    ) -> HashMap<BackendHandle, Result<BackendStatus, BackendError>> {
        if handles.is_empty() {
            return HashMap::new();
        }
        let mut args = vec!["-noheader".to_string(), "-o".to_string(), BJOBS_FORMAT.to_string()];
        args.extend(handles.iter().map(|h| h.id.clone()));

        // bjobs exits non-zero when any id is unknown but still reports the rest.
        let known = match self.runner.run(&self.config.bjobs, &args).await {
            Ok(output) => parse_bjobs_output(&output.stdout),
            Err(e) => {
                let message = format!("failed to run `{}`: {e}", self.config.bjobs);
                return handles
                    .iter()
                    .map(|h| (h.clone(), Err(BackendError::new(&h.id, message.clone()))))
                    .collect();
            }
        };

        handles
            .iter()
            .map(|h| {
                let status = known
                    .get(&h.id)
                    .cloned()
                    .ok_or_else(|| BackendError::new(&h.id, "job not reported by bjobs"));
                (h.clone(), status)
            })
            .collect()
    }

    async fn cancel(&self, handle: &BackendHandle) {
        let args = vec![handle.id.clone()];
        match self.runner.run(&self.config.bkill, &args).await {
            Ok(output) if output.success() => debug!(handle = %handle, "bkill accepted"),
            // bkill on a finished job fails; that is fine.
            Ok(output) => debug!(handle = %handle, stderr = %output.stderr.trim(), "bkill refused"),
            Err(e) => warn!(handle = %handle, error = %e, "failed to run bkill"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CommandOutput, MockCommandRunner};
    use crate::core::{JobId, RunId};
    use crate::pipeline::{CommandSpec, Executable};
    use crate::stages::NoOpTask;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::Duration;

    fn request(dir: &Path) -> JobRequest {
        JobRequest {
            run_id: RunId::from_number(3),
            job: JobId::per_sample("reads", "s2"),
            attempt: 1,
            executable: CommandSpec::new("simulate").into(),
            resource_class: "heavy".into(),
            timeout: Some(Duration::from_secs(90)),
            output_dir: dir.to_path_buf(),
        }
    }

    fn classes() -> BTreeMap<ResourceClass, ResourceRequest> {
        BTreeMap::from([(
            ResourceClass::new("heavy"),
            ResourceRequest::new(4, 16_000).with_queue("long"),
        )])
    }

    #[test]
    fn test_parse_bsub_output() {
        assert_eq!(
            parse_bsub_output("Job <4711> is submitted to queue <normal>.\n"),
            Some("4711".to_string())
        );
        assert_eq!(parse_bsub_output("Request aborted by esub."), None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_lsf_status("PEND", "-"), Some(BackendStatus::Queued));
        assert_eq!(map_lsf_status("SSUSP", "-"), Some(BackendStatus::Running));
        assert_eq!(map_lsf_status("DONE", "-"), Some(BackendStatus::Succeeded));
        assert_eq!(
            map_lsf_status("EXIT", "2"),
            Some(BackendStatus::failed(Some(2), "LSF job state EXIT"))
        );
        assert_eq!(
            map_lsf_status("UNKWN", "-"),
            Some(BackendStatus::failed(None, "LSF job state UNKWN"))
        );
        assert_eq!(map_lsf_status("???", "-"), None);
    }

    #[test]
    fn test_parse_bjobs_output() {
        let parsed = parse_bjobs_output("101,RUN,-\n102,DONE,-\n103,EXIT,1\n\n");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["101"], BackendStatus::Running);
        assert_eq!(parsed["102"], BackendStatus::Succeeded);
        assert!(matches!(parsed["103"], BackendStatus::Failed { exit_code: Some(1), .. }));
    }

    #[test]
    fn test_bsub_args() {
        let backend = LsfBackend::new(
            LsfConfig::default().with_extra_bsub_args(["-P", "proj"]),
            classes(),
            Arc::new(MockCommandRunner::new()),
        );
        let args = backend.bsub_args(&request(Path::new("/out")), "/out/job.sh");
        assert_eq!(
            args,
            vec![
                "-J", "rf3_reads.s2", "-q", "long", "-n", "4", "-R", "rusage[mem=16000]", "-W",
                "2", "-o", "/out/stdout.log", "-e", "/out/stderr.log", "-P", "proj",
                "/out/job.sh",
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_parses_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|program, args| {
            assert_eq!(program, "bsub");
            assert!(args.last().unwrap().ends_with("job.sh"));
            Ok(CommandOutput::ok("Job <88> is submitted to queue <long>.\n"))
        });
        let backend = LsfBackend::new(LsfConfig::default(), classes(), Arc::new(runner));

        let handle = backend.submit(&request(dir.path())).await.unwrap();
        assert_eq!(handle, BackendHandle::new(BackendMode::Lsf, "88"));
        assert!(dir.path().join("job.sh").exists());
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::failed(255, "Bad resource requirement syntax")));
        let backend = LsfBackend::new(LsfConfig::default(), classes(), Arc::new(runner));

        let err = backend.submit(&request(dir.path())).await.unwrap_err();
        assert!(err.message.contains("Bad resource requirement"));
    }

    #[tokio::test]
    async fn test_submit_rejects_tasks_without_calling_bsub() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let backend = LsfBackend::new(LsfConfig::default(), classes(), Arc::new(runner));

        let mut req = request(dir.path());
        req.executable = Executable::Task(Arc::new(NoOpTask));
        assert!(backend.submit(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_poll_many_uses_one_bjobs_call() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|program, args| {
            assert_eq!(program, "bjobs");
            assert_eq!(args[2], BJOBS_FORMAT);
            assert_eq!(&args[3..], &["1".to_string(), "2".to_string(), "3".to_string()]);
            Ok(CommandOutput {
                status: Some(255),
                stdout: "1,PEND,-\n2,DONE,-\n".to_string(),
                stderr: "Job <3> is not found\n".to_string(),
            })
        });
        let backend = LsfBackend::new(LsfConfig::default(), BTreeMap::new(), Arc::new(runner));

        let handles: Vec<_> = ["1", "2", "3"]
            .iter()
            .map(|id| BackendHandle::new(BackendMode::Lsf, *id))
            .collect();
        let statuses = backend.poll_many(&handles).await;

        assert_eq!(statuses[&handles[0]].as_ref().unwrap(), &BackendStatus::Queued);
        assert_eq!(statuses[&handles[1]].as_ref().unwrap(), &BackendStatus::Succeeded);
        assert!(statuses[&handles[2]].is_err());
    }

    #[tokio::test]
    async fn test_poll_command_failure_is_transient_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no bjobs")));
        let backend = LsfBackend::new(LsfConfig::default(), BTreeMap::new(), Arc::new(runner));

        let err = backend
            .poll(&BackendHandle::new(BackendMode::Lsf, "9"))
            .await
            .unwrap_err();
        assert!(err.message.contains("no bjobs"));
    }

    #[tokio::test]
    async fn test_cancel_runs_bkill_and_tolerates_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(2).returning(|program, args| {
            assert_eq!(program, "bkill");
            assert_eq!(args, &["5".to_string()]);
            Ok(CommandOutput::failed(255, "Job has already finished"))
        });
        let backend = LsfBackend::new(LsfConfig::default(), BTreeMap::new(), Arc::new(runner));

        let handle = BackendHandle::new(BackendMode::Lsf, "5");
        backend.cancel(&handle).await;
        backend.cancel(&handle).await;
    }
}
