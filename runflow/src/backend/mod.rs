//! Execution backends.
//!
//! A backend accepts a job, hands back an opaque [`BackendHandle`] right
//! away, and answers status queries without blocking. The scheduler never
//! knows which backend it talks to.
//!
//! - [`LocalBackend`]: child processes (and in-process tasks) on this machine
//! - [`LsfBackend`]: `bsub` / `bjobs` / `bkill`
//! - [`SgeBackend`]: `qsub` / `qstat` / `qacct` / `qdel`

mod command;
mod local;
mod lsf;
mod script;
mod sge;

pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use local::{LocalBackend, LocalConfig};
pub use lsf::{LsfBackend, LsfConfig};
pub use script::{render_job_script, shell_quote};
pub use sge::{SgeBackend, SgeConfig};

#[cfg(test)]
pub(crate) use command::MockCommandRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{JobId, ResourceClass, ResourceRequest, RunId};
use crate::errors::{BackendError, ConfigError, SubmissionError};
use crate::pipeline::{Executable, Job};

/// Which execution substrate a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Processes on this machine.
    #[default]
    #[serde(alias = "serial")]
    Local,
    /// IBM Spectrum LSF.
    Lsf,
    /// Sun/Univa/Son of Grid Engine.
    Sge,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Lsf => write!(f, "lsf"),
            Self::Sge => write!(f, "sge"),
        }
    }
}

impl FromStr for BackendMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "serial" => Ok(Self::Local),
            "lsf" => Ok(Self::Lsf),
            "sge" => Ok(Self::Sge),
            other => Err(ConfigError::new(format!(
                "unknown dispatcher mode '{other}'; expected local, serial, lsf or sge"
            ))),
        }
    }
}

/// Opaque token identifying one submission to one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle {
    /// The backend that issued the handle.
    pub backend: BackendMode,
    /// The backend-side id (pid-independent token, LSF or SGE job id).
    pub id: String,
}

impl BackendHandle {
    /// Creates a new handle.
    #[must_use]
    pub fn new(backend: BackendMode, id: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
        }
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

/// What a backend knows about a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Accepted but not started (e.g. waiting in a cluster queue).
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed {
        /// Exit code, when known.
        exit_code: Option<i32>,
        /// Backend-specific detail.
        message: String,
    },
}

impl BackendStatus {
    /// Creates a failure status.
    #[must_use]
    pub fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Failed {
            exit_code,
            message: message.into(),
        }
    }

    /// Returns true if the job will not change status again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Everything a backend needs to start one attempt of a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// The run the job belongs to.
    pub run_id: RunId,
    /// The job.
    pub job: JobId,
    /// One-based attempt number.
    pub attempt: u32,
    /// What to execute.
    pub executable: Executable,
    /// Concurrency class, mapped to a resource request by cluster backends.
    pub resource_class: ResourceClass,
    /// Wall-clock budget, forwarded to cluster schedulers as a run limit.
    pub timeout: Option<Duration>,
    /// Where the job writes its output and logs.
    pub output_dir: PathBuf,
}

impl JobRequest {
    /// Builds the request for the next attempt of `job`.
    #[must_use]
    pub fn for_job(run_id: &RunId, job: &Job, output_dir: PathBuf) -> Self {
        let stage = job.stage();
        Self {
            run_id: run_id.clone(),
            job: job.id().clone(),
            attempt: job.attempts() + 1,
            executable: stage.executable.clone(),
            resource_class: stage.resource_class.clone(),
            timeout: stage.timeout,
            output_dir,
        }
    }

    /// Path of the captured standard output.
    #[must_use]
    pub fn stdout_path(&self) -> PathBuf {
        self.output_dir.join("stdout.log")
    }

    /// Path of the captured standard error.
    #[must_use]
    pub fn stderr_path(&self) -> PathBuf {
        self.output_dir.join("stderr.log")
    }

    /// Environment exported to every job on top of the command's own.
    #[must_use]
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("RUNFLOW_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("RUNFLOW_JOB".to_string(), self.job.to_string());
        env.insert("RUNFLOW_STAGE".to_string(), self.job.stage.clone());
        if let Some(sample) = &self.job.sample {
            env.insert("RUNFLOW_SAMPLE".to_string(), sample.clone());
        }
        env.insert("RUNFLOW_ATTEMPT".to_string(), self.attempt.to_string());
        env.insert(
            "RUNFLOW_OUTPUT_DIR".to_string(),
            self.output_dir.display().to_string(),
        );
        if let Executable::Command(cmd) = &self.executable {
            env.extend(cmd.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }
}

/// The capability every execution substrate provides.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    /// Returns which backend this is.
    fn mode(&self) -> BackendMode;

    /// Starts a job and returns without waiting for it to finish.
    async fn submit(&self, request: &JobRequest) -> Result<BackendHandle, SubmissionError>;

    /// Reports the status of one submission.
    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError>;

    /// Reports the status of many submissions. Backends with a remote status
    /// command override this to answer with one call.
    async fn poll_many(
        &self,
        handles: &[BackendHandle],
    ) -> HashMap<BackendHandle, Result<BackendStatus, BackendError>> {
        let mut statuses = HashMap::with_capacity(handles.len());
        for handle in handles {
            statuses.insert(handle.clone(), self.poll(handle).await);
        }
        statuses
    }

    /// Asks the backend to stop a job. Best effort and idempotent.
    async fn cancel(&self, handle: &BackendHandle);
}

/// Settings for every backend; only the one selected by `mode` is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// The backend to instantiate.
    #[serde(default)]
    pub mode: BackendMode,
    /// Cluster resource requests per resource class.
    #[serde(default)]
    pub resource_classes: BTreeMap<ResourceClass, ResourceRequest>,
    /// Local backend settings.
    #[serde(default)]
    pub local: LocalConfig,
    /// LSF settings.
    #[serde(default)]
    pub lsf: LsfConfig,
    /// SGE settings.
    #[serde(default)]
    pub sge: SgeConfig,
}

impl BackendConfig {
    /// Creates a configuration for `mode` with defaults everywhere else.
    #[must_use]
    pub fn new(mode: BackendMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Maps a resource class to a cluster request.
    #[must_use]
    pub fn with_resource_class(mut self, class: impl Into<ResourceClass>, request: ResourceRequest) -> Self {
        self.resource_classes.insert(class.into(), request);
        self
    }

    /// Returns the request for `class`, falling back to the default request.
    #[must_use]
    pub fn request_for(&self, class: &ResourceClass) -> ResourceRequest {
        self.resource_classes.get(class).cloned().unwrap_or_default()
    }
}

/// Instantiates the backend selected by `config.mode`.
#[must_use]
pub fn create_backend(config: &BackendConfig) -> Arc<dyn ExecutionBackend> {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    match config.mode {
        BackendMode::Local => Arc::new(LocalBackend::new(config.local.clone())),
        BackendMode::Lsf => Arc::new(LsfBackend::new(
            config.lsf.clone(),
            config.resource_classes.clone(),
            runner,
        )),
        BackendMode::Sge => Arc::new(SgeBackend::new(
            config.sge.clone(),
            config.resource_classes.clone(),
            runner,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CommandSpec, StageDefinition};
    use std::collections::BTreeSet;

    #[test]
    fn test_backend_mode_parsing() {
        assert_eq!("local".parse::<BackendMode>().unwrap(), BackendMode::Local);
        assert_eq!("serial".parse::<BackendMode>().unwrap(), BackendMode::Local);
        assert_eq!("LSF".parse::<BackendMode>().unwrap(), BackendMode::Lsf);
        assert_eq!("sge".parse::<BackendMode>().unwrap(), BackendMode::Sge);
        assert!("slurm".parse::<BackendMode>().is_err());
    }

    #[test]
    fn test_backend_mode_serde_alias() {
        let mode: BackendMode = serde_json::from_str(r#""serial""#).unwrap();
        assert_eq!(mode, BackendMode::Local);
        assert_eq!(serde_json::to_string(&BackendMode::Lsf).unwrap(), r#""lsf""#);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(BackendHandle::new(BackendMode::Lsf, "123").to_string(), "lsf:123");
    }

    #[test]
    fn test_request_environment() {
        let stage = Arc::new(
            StageDefinition::per_sample("molecules", CommandSpec::new("sim").env("SEED", "7"))
                .with_resource_class("heavy"),
        );
        let job = Job::new(JobId::per_sample("molecules", "s1"), stage, BTreeSet::new());
        let req = JobRequest::for_job(&RunId::from_number(4), &job, PathBuf::from("/out/s1"));

        assert_eq!(req.attempt, 1);
        assert_eq!(req.resource_class.as_str(), "heavy");
        assert_eq!(req.stdout_path(), PathBuf::from("/out/s1/stdout.log"));

        let env = req.environment();
        assert_eq!(env["RUNFLOW_RUN_ID"], "4");
        assert_eq!(env["RUNFLOW_JOB"], "molecules[s1]");
        assert_eq!(env["RUNFLOW_SAMPLE"], "s1");
        assert_eq!(env["SEED"], "7");
    }

    #[test]
    fn test_request_for_falls_back_to_default() {
        let config = BackendConfig::new(BackendMode::Lsf)
            .with_resource_class("heavy", ResourceRequest::new(8, 32_000));
        assert_eq!(config.request_for(&"heavy".into()).cpus, 8);
        assert_eq!(config.request_for(&"light".into()), ResourceRequest::default());
    }

    #[test]
    fn test_create_backend_selects_mode() {
        for mode in [BackendMode::Local, BackendMode::Lsf, BackendMode::Sge] {
            assert_eq!(create_backend(&BackendConfig::new(mode)).mode(), mode);
        }
    }
}
