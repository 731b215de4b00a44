//! Grid Engine (SGE, UGE, OGS) backend.
//!
//! Jobs are submitted with `qsub -terse`. Live jobs are read from one
//! `qstat` listing per poll; jobs that have left the queue are resolved
//! through `qacct`. Accounting records appear some time after a job leaves
//! `qstat`, so a job missing from both is reported as still running until
//! the accounting grace window runs out.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::script::{cluster_job_name, resource_request, write_job_script};
use super::{
    BackendHandle, BackendMode, BackendStatus, CommandRunner, ExecutionBackend, JobRequest,
};
use crate::core::{ResourceClass, ResourceRequest};
use crate::errors::{BackendError, SubmissionError};

#[allow(clippy::expect_used)]
static QSTAT_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+\S+\s+\S+\s+\S+\s+(\S+)\s").expect("valid regex")
});

#[allow(clippy::expect_used)]
static QACCT_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^failed\s+(\d+)").expect("valid regex"));

#[allow(clippy::expect_used)]
static QACCT_EXIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^exit_status\s+(\d+)").expect("valid regex"));

/// Settings for the SGE backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgeConfig {
    /// Default queue; resource classes may override it.
    #[serde(default)]
    pub queue: Option<String>,
    /// Parallel environment used for multi-core requests.
    #[serde(default = "default_parallel_env")]
    pub parallel_env: String,
    /// Extra arguments appended to every `qsub` invocation.
    #[serde(default)]
    pub extra_qsub_args: Vec<String>,
    /// Submission command.
    #[serde(default = "default_qsub")]
    pub qsub: String,
    /// Live status command.
    #[serde(default = "default_qstat")]
    pub qstat: String,
    /// Accounting command for finished jobs.
    #[serde(default = "default_qacct")]
    pub qacct: String,
    /// Cancellation command.
    #[serde(default = "default_qdel")]
    pub qdel: String,
    /// How long a job may be missing from both `qstat` and `qacct` before
    /// status queries for it fail.
    #[serde(default = "default_accounting_grace_ms")]
    pub accounting_grace_ms: u64,
}

fn default_parallel_env() -> String {
    "smp".to_string()
}

fn default_qsub() -> String {
    "qsub".to_string()
}

fn default_qstat() -> String {
    "qstat".to_string()
}

fn default_qacct() -> String {
    "qacct".to_string()
}

fn default_qdel() -> String {
    "qdel".to_string()
}

fn default_accounting_grace_ms() -> u64 {
    60_000
}

impl Default for SgeConfig {
    fn default() -> Self {
        Self {
            queue: None,
            parallel_env: default_parallel_env(),
            extra_qsub_args: Vec::new(),
            qsub: default_qsub(),
            qstat: default_qstat(),
            qacct: default_qacct(),
            qdel: default_qdel(),
            accounting_grace_ms: default_accounting_grace_ms(),
        }
    }
}

impl SgeConfig {
    /// Sets the default queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Sets the parallel environment.
    #[must_use]
    pub fn with_parallel_env(mut self, env: impl Into<String>) -> Self {
        self.parallel_env = env.into();
        self
    }

    /// Sets the accounting grace window.
    #[must_use]
    pub fn with_accounting_grace(mut self, grace: Duration) -> Self {
        self.accounting_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the accounting grace window.
    #[must_use]
    pub fn accounting_grace(&self) -> Duration {
        Duration::from_millis(self.accounting_grace_ms)
    }
}

/// Submits jobs to Grid Engine.
pub struct SgeBackend {
    config: SgeConfig,
    resource_classes: BTreeMap<ResourceClass, ResourceRequest>,
    runner: Arc<dyn CommandRunner>,
    /// When each job was first found in neither `qstat` nor `qacct`.
    unaccounted: DashMap<String, Instant>,
}

impl std::fmt::Debug for SgeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SgeBackend")
            .field("config", &self.config)
            .field("resource_classes", &self.resource_classes)
            .finish_non_exhaustive()
    }
}

fn format_h_rt(timeout: Duration) -> String {
    let secs = timeout.as_secs().max(1);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl SgeBackend {
    /// Creates a new SGE backend.
    #[must_use]
    pub fn new(
        config: SgeConfig,
        resource_classes: BTreeMap<ResourceClass, ResourceRequest>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            resource_classes,
            runner,
            unaccounted: DashMap::new(),
        }
    }

    /// Builds the `qsub` argument list for `request`, ending with the script.
    #[must_use]
    pub fn qsub_args(&self, request: &JobRequest, script: &str) -> Vec<String> {
        let resources = resource_request(&self.resource_classes, request);
        let mut args = vec![
            "-terse".to_string(),
            "-N".to_string(),
            cluster_job_name(request),
            "-wd".to_string(),
            request.output_dir.display().to_string(),
        ];

        if let Some(queue) = resources.queue.as_ref().or(self.config.queue.as_ref()) {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        if resources.cpus > 1 {
            args.push("-pe".to_string());
            args.push(self.config.parallel_env.clone());
            args.push(resources.cpus.to_string());
        }
        args.push("-l".to_string());
        args.push(format!("h_vmem={}M", resources.memory_mb));
        if let Some(timeout) = request.timeout {
            args.push("-l".to_string());
            args.push(format!("h_rt={}", format_h_rt(timeout)));
        }
        args.push("-o".to_string());
        args.push(request.stdout_path().display().to_string());
        args.push("-e".to_string());
        args.push(request.stderr_path().display().to_string());
        args.extend(self.config.extra_qsub_args.iter().cloned());
        args.push(script.to_string());
        args
    }

    async fn resolve_finished(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let args = vec!["-j".to_string(), handle.id.clone()];
        let output = self
            .runner
            .run(&self.config.qacct, &args)
            .await
            .map_err(|e| BackendError::new(&handle.id, format!("failed to run `{}`: {e}", self.config.qacct)))?;
        if !output.success() {
            let since = *self.unaccounted.entry(handle.id.clone()).or_insert_with(Instant::now);
            if since.elapsed() < self.config.accounting_grace() {
                debug!(handle = %handle, "left qstat, no accounting record yet");
                return Ok(BackendStatus::Running);
            }
            return Err(BackendError::new(
                &handle.id,
                format!("qacct has no record yet: {}", output.stderr.trim()),
            ));
        }
        self.unaccounted.remove(&handle.id);
        parse_qacct_output(&output.stdout)
            .ok_or_else(|| BackendError::new(&handle.id, "unrecognized qacct output"))
    }
}

/// Extracts the job id from `qsub -terse` output (`123` or `123.1-10:1`).
#[must_use]
pub fn parse_qsub_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id: String = line.chars().take_while(char::is_ascii_digit).collect();
    (!id.is_empty()).then_some(id)
}

/// Maps a `qstat` state code to a backend status.
#[must_use]
pub fn map_sge_state(state: &str) -> BackendStatus {
    if state.contains('E') {
        BackendStatus::failed(None, format!("SGE job in error state {state}"))
    } else if state.contains('q') || state.contains('w') {
        BackendStatus::Queued
    } else {
        BackendStatus::Running
    }
}

/// Parses the job table printed by `qstat`.
#[must_use]
pub fn parse_qstat_output(stdout: &str) -> HashMap<String, BackendStatus> {
    stdout
        .lines()
        .filter_map(|line| QSTAT_ROW.captures(line))
        .filter_map(|caps| {
            let id = caps.get(1)?.as_str().to_string();
            let state = caps.get(2)?.as_str();
            Some((id, map_sge_state(state)))
        })
        .collect()
}

/// Reads the final status of a job from `qacct -j` output.
#[must_use]
pub fn parse_qacct_output(stdout: &str) -> Option<BackendStatus> {
    let field = |re: &Regex| -> Option<i32> { re.captures(stdout)?.get(1)?.as_str().parse().ok() };
    let failed = field(&QACCT_FAILED)?;
    let exit_status = field(&QACCT_EXIT)?;
    if failed == 0 && exit_status == 0 {
        Some(BackendStatus::Succeeded)
    } else {
        Some(BackendStatus::failed(
            Some(exit_status),
            format!("qacct reports failed={failed} exit_status={exit_status}"),
        ))
    }
}

#[async_trait]
impl ExecutionBackend for SgeBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Sge
    }

    async fn submit(&self, request: &JobRequest) -> Result<BackendHandle, SubmissionError> {
        let script = write_job_script(request).await?;
        let args = self.qsub_args(request, &script.display().to_string());

        let output = self.runner.run(&self.config.qsub, &args).await.map_err(|e| {
            SubmissionError::new(request.job.clone(), format!("failed to run `{}`: {e}", self.config.qsub))
        })?;
        if !output.success() {
            return Err(SubmissionError::new(
                request.job.clone(),
                format!("qsub exited with {:?}: {}", output.status, output.stderr.trim()),
            ));
        }
        let id = parse_qsub_output(&output.stdout).ok_or_else(|| {
            SubmissionError::new(
                request.job.clone(),
                format!("unrecognized qsub output: {}", output.stdout.trim()),
            )
        })?;

        debug!(job = %request.job, sge_job = %id, attempt = request.attempt, "submitted to SGE");
        Ok(BackendHandle::new(BackendMode::Sge, id))
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

        let listed = match self.runner.run(&self.config.qstat, &[]).await {
            Ok(output) if output.success() => parse_qstat_output(&output.stdout),
            Ok(output) => {
                let message = format!("qstat exited with {:?}: {}", output.status, output.stderr.trim());
                return handles
                    .iter()
                    .map(|h| (h.clone(), Err(BackendError::new(&h.id, message.clone()))))
                    .collect();
            }
            Err(e) => {
                let message = format!("failed to run `{}`: {e}", self.config.qstat);
                return handles
                    .iter()
                    .map(|h| (h.clone(), Err(BackendError::new(&h.id, message.clone()))))
                    .collect();
            }
        };

        let mut statuses = HashMap::with_capacity(handles.len());
        for handle in handles {
            let status = match listed.get(&handle.id) {
                Some(status @ BackendStatus::Failed { .. }) => {
                    // Error-state jobs stay in the queue until deleted.
                    self.cancel(handle).await;
                    Ok(status.clone())
                }
                Some(status) => Ok(status.clone()),
                None => self.resolve_finished(handle).await,
            };
            statuses.insert(handle.clone(), status);
        }
        statuses
    }

    async fn cancel(&self, handle: &BackendHandle) {
        self.unaccounted.remove(&handle.id);
        let args = vec![handle.id.clone()];
        match self.runner.run(&self.config.qdel, &args).await {
            Ok(output) if output.success() => debug!(handle = %handle, "qdel accepted"),
            Ok(output) => debug!(handle = %handle, stderr = %output.stderr.trim(), "qdel refused"),
            Err(e) => warn!(handle = %handle, error = %e, "failed to run qdel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CommandOutput, MockCommandRunner};
    use crate::core::{JobId, RunId};
    use crate::pipeline::CommandSpec;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
     11 0.55500 rf1_a      alice        r     05/01/2024 10:00:00 all.q@node1                        1
     12 0.00000 rf1_b      alice        qw    05/01/2024 10:00:05                                    4
     13 0.00000 rf1_c      alice        Eqw   05/01/2024 10:00:06                                    1
";

    const QACCT_OK: &str = "\
==============================================================
qname        all.q
jobname      rf1_d
jobnumber    14
failed       0
exit_status  0
";

    const QACCT_FAILED: &str = "\
==============================================================
jobnumber    15
failed       0
exit_status  137
";

    fn request(dir: &Path) -> JobRequest {
        JobRequest {
            run_id: RunId::from_number(1),
            job: JobId::run_wide("genome"),
            attempt: 1,
            executable: CommandSpec::new("index").into(),
            resource_class: "heavy".into(),
            timeout: Some(Duration::from_secs(3725)),
            output_dir: dir.to_path_buf(),
        }
    }

    fn classes() -> BTreeMap<ResourceClass, ResourceRequest> {
        BTreeMap::from([(ResourceClass::new("heavy"), ResourceRequest::new(8, 32_000))])
    }

    fn handle(id: &str) -> BackendHandle {
        BackendHandle::new(BackendMode::Sge, id)
    }

    #[test]
    fn test_parse_qsub_output() {
        assert_eq!(parse_qsub_output("4242\n"), Some("4242".to_string()));
        assert_eq!(parse_qsub_output("\n77.1-10:1\n"), Some("77".to_string()));
        assert_eq!(parse_qsub_output("Unable to run job"), None);
    }

    #[test]
    fn test_map_sge_state() {
        assert_eq!(map_sge_state("qw"), BackendStatus::Queued);
        assert_eq!(map_sge_state("hqw"), BackendStatus::Queued);
        assert_eq!(map_sge_state("r"), BackendStatus::Running);
        assert_eq!(map_sge_state("t"), BackendStatus::Running);
        assert!(matches!(map_sge_state("Eqw"), BackendStatus::Failed { .. }));
    }

    #[test]
    fn test_parse_qstat_output() {
        let parsed = parse_qstat_output(QSTAT);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["11"], BackendStatus::Running);
        assert_eq!(parsed["12"], BackendStatus::Queued);
        assert!(matches!(parsed["13"], BackendStatus::Failed { .. }));
    }

    #[test]
    fn test_parse_qacct_output() {
        assert_eq!(parse_qacct_output(QACCT_OK), Some(BackendStatus::Succeeded));
        assert!(matches!(
            parse_qacct_output(QACCT_FAILED),
            Some(BackendStatus::Failed { exit_code: Some(137), .. })
        ));
        assert_eq!(parse_qacct_output("garbage"), None);
    }

    #[test]
    fn test_format_h_rt() {
        assert_eq!(format_h_rt(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_h_rt(Duration::from_millis(10)), "00:00:01");
    }

    #[test]
    fn test_qsub_args() {
        let backend = SgeBackend::new(
            SgeConfig::default().with_queue("all.q"),
            classes(),
            Arc::new(MockCommandRunner::new()),
        );
        let args = backend.qsub_args(&request(Path::new("/out")), "/out/job.sh");
        assert_eq!(
            args,
            vec![
                "-terse", "-N", "rf1_genome", "-wd", "/out", "-q", "all.q", "-pe", "smp", "8",
                "-l", "h_vmem=32000M", "-l", "h_rt=01:02:05", "-o", "/out/stdout.log", "-e",
                "/out/stderr.log", "/out/job.sh",
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_parses_terse_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|program, args| {
            assert_eq!(program, "qsub");
            assert_eq!(args[0], "-terse");
            Ok(CommandOutput::ok("901\n"))
        });
        let backend = SgeBackend::new(SgeConfig::default(), classes(), Arc::new(runner));

        let handle = backend.submit(&request(dir.path())).await.unwrap();
        assert_eq!(handle, BackendHandle::new(BackendMode::Sge, "901"));
    }

    #[tokio::test]
    async fn test_poll_many_combines_qstat_and_qacct() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        runner
            .expect_run()
            .withf(|program, _| program == "qstat")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok(QSTAT)));
        runner
            .expect_run()
            .withf(|program, args| program == "qdel" && args == ["13".to_string()])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        runner
            .expect_run()
            .withf(|program, args| program == "qacct" && args == ["-j".to_string(), "14".to_string()])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok(QACCT_OK)));
        let backend = SgeBackend::new(SgeConfig::default(), BTreeMap::new(), Arc::new(runner));

        let handles = vec![handle("11"), handle("13"), handle("14")];
        let statuses = backend.poll_many(&handles).await;

        assert_eq!(statuses[&handles[0]].as_ref().unwrap(), &BackendStatus::Running);
        assert!(matches!(
            statuses[&handles[1]].as_ref().unwrap(),
            BackendStatus::Failed { .. }
        ));
        assert_eq!(statuses[&handles[2]].as_ref().unwrap(), &BackendStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_missing_accounting_is_transient() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|program, _| {
            if program == "qstat" {
                Ok(CommandOutput::ok(""))
            } else {
                Ok(CommandOutput::failed(1, "error: job id 20 not found"))
            }
        });
        let config = SgeConfig::default().with_accounting_grace(Duration::ZERO);
        let backend = SgeBackend::new(config, BTreeMap::new(), Arc::new(runner));

        let err = backend.poll(&handle("20")).await.unwrap_err();
        assert!(err.message.contains("no record yet"));
    }

    #[tokio::test]
    async fn test_accounting_lag_within_grace_reports_running() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        for _ in 0..6 {
            runner
                .expect_run()
                .withf(|program, _| program == "qstat")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(CommandOutput::ok("")));
            runner
                .expect_run()
                .withf(|program, _| program == "qacct")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(CommandOutput::failed(1, "error: job id 21 not found")));
        }
        runner
            .expect_run()
            .withf(|program, _| program == "qstat")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        runner
            .expect_run()
            .withf(|program, _| program == "qacct")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok(QACCT_OK)));
        let config = SgeConfig::default().with_accounting_grace(Duration::from_secs(3600));
        let backend = SgeBackend::new(config, BTreeMap::new(), Arc::new(runner));

        for _ in 0..6 {
            assert_eq!(backend.poll(&handle("21")).await.unwrap(), BackendStatus::Running);
        }
        assert_eq!(backend.poll(&handle("21")).await.unwrap(), BackendStatus::Succeeded);
        assert!(backend.unaccounted.is_empty());
    }

    #[test]
    fn test_accounting_grace_defaults_and_deserializes() {
        assert_eq!(SgeConfig::default().accounting_grace(), Duration::from_secs(60));
        let config: SgeConfig = serde_json::from_str(r#"{"accounting_grace_ms": 1500}"#).unwrap();
        assert_eq!(config.accounting_grace(), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_qstat_failure_errors_every_handle() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(CommandOutput::failed(1, "cannot reach qmaster")));
        let backend = SgeBackend::new(SgeConfig::default(), BTreeMap::new(), Arc::new(runner));

        let handles = vec![handle("1"), handle("2")];
        let statuses = backend.poll_many(&handles).await;
        assert!(statuses.values().all(Result::is_err));
    }
}
