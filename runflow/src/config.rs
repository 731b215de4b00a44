//! Run configuration.
//!
//! Everything except the stage definitions themselves can be loaded from a
//! JSON document. Durations are given in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendConfig, BackendMode};
use crate::core::RunId;
use crate::errors::ConfigError;
use crate::observability::LogFormat;
use crate::pipeline::LimiterConfig;

/// Tunables of the coordinating loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between loop iterations.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long an abort waits for backends to confirm cancellation.
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
    /// Consecutive failed status queries after which a job is considered lost.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    /// Abort the whole run on the first permanent job failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Concurrency ceilings.
    #[serde(default)]
    pub limits: LimiterConfig,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_cancel_timeout_ms() -> u64 {
    30_000
}

fn default_max_poll_failures() -> u32 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            max_poll_failures: default_max_poll_failures(),
            fail_fast: false,
            limits: LimiterConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the cancellation timeout.
    #[must_use]
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the poll failure threshold.
    #[must_use]
    pub fn with_max_poll_failures(mut self, failures: u32) -> Self {
        self.max_poll_failures = failures;
        self
    }

    /// Enables or disables fail-fast.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Sets the concurrency ceilings.
    #[must_use]
    pub fn with_limits(mut self, limits: LimiterConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the cancellation timeout.
    #[must_use]
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero poll interval or a zero concurrency limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::new("poll_interval_ms must be greater than zero"));
        }
        if self.limits.global_limit == Some(0) {
            return Err(ConfigError::new("global concurrency limit must be greater than zero"));
        }
        if let Some((class, _)) = self.limits.class_limits.iter().find(|(_, &limit)| limit == 0) {
            return Err(ConfigError::new(format!(
                "concurrency limit for resource class '{class}' must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Everything needed to execute one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// The run identifier.
    pub run_id: RunId,
    /// Directory under which `run_<id>` is created.
    pub output_root: PathBuf,
    /// Allow writing into an already populated run directory.
    #[serde(default)]
    pub reuse: bool,
    /// Scheduler tunables.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Backend selection and settings.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl RunConfig {
    /// Creates a configuration for the local backend.
    #[must_use]
    pub fn new(run_id: RunId, output_root: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            output_root: output_root.into(),
            reuse: false,
            scheduler: SchedulerConfig::default(),
            backend: BackendConfig::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Allows reuse of a populated run directory.
    #[must_use]
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Sets the scheduler configuration.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the backend configuration.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Selects the backend, keeping its other settings.
    #[must_use]
    pub fn with_backend_mode(mut self, mode: BackendMode) -> Self {
        self.backend.mode = mode;
        self
    }

    /// Parses a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty output root or invalid scheduler values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_root.as_os_str().is_empty() {
            return Err(ConfigError::new("output_root cannot be empty"));
        }
        self.scheduler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceClass;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.cancel_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_poll_failures, 5);
        assert!(!config.fail_fast);
        assert_eq!(config.limits.global_limit, None);
    }

    #[test]
    fn test_minimal_json() {
        let config = RunConfig::from_json_str(r#"{"run_id": "7", "output_root": "/data"}"#).unwrap();
        assert_eq!(config.run_id.number(), Some(7));
        assert_eq!(config.backend.mode, BackendMode::Local);
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert!(!config.reuse);
    }

    #[test]
    fn test_full_json() {
        let json = r#"{
            "run_id": "mouse_3",
            "output_root": "/scratch/sim",
            "reuse": true,
            "log_format": "json",
            "scheduler": {
                "poll_interval_ms": 250,
                "fail_fast": true,
                "limits": {"global_limit": 10, "class_limits": {"heavy": 2}}
            },
            "backend": {
                "mode": "serial",
                "resource_classes": {"heavy": {"cpus": 4, "memory_mb": 32000, "queue": "long"}},
                "lsf": {"queue": "normal"}
            }
        }"#;
        let config = RunConfig::from_json_str(json).unwrap();

        assert!(config.reuse);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.scheduler.limits.class_limits[&ResourceClass::new("heavy")], 2);
        assert_eq!(config.backend.mode, BackendMode::Local);
        assert_eq!(config.backend.lsf.queue.as_deref(), Some("normal"));
        assert_eq!(config.backend.lsf.bsub, "bsub");
        assert_eq!(config.backend.request_for(&"heavy".into()).cpus, 4);
    }

    #[test]
    fn test_invalid_documents() {
        assert!(RunConfig::from_json_str(r#"{"run_id": "bad-id", "output_root": "/x"}"#).is_err());
        assert!(RunConfig::from_json_str(r#"{"run_id": "1"}"#).is_err());
        assert!(RunConfig::from_json_str(
            r#"{"run_id": "1", "output_root": "/x", "scheduler": {"poll_interval_ms": 0}}"#
        )
        .is_err());
        assert!(RunConfig::from_json_str(
            r#"{"run_id": "1", "output_root": "/x", "backend": {"mode": "slurm"}}"#
        )
        .is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = SchedulerConfig::new().with_limits(LimiterConfig::new().with_class_limit("heavy", 0));
        assert!(config.validate().is_err());
        let config = SchedulerConfig::new().with_limits(LimiterConfig::new().with_global_limit(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"run_id": "2", "output_root": "/out"}"#).unwrap();
        assert_eq!(RunConfig::from_json_file(&path).unwrap().run_id.as_str(), "2");
        assert!(RunConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_builders() {
        let config = RunConfig::new(RunId::from_number(1), "/out")
            .with_reuse(true)
            .with_backend_mode(BackendMode::Sge)
            .with_scheduler(SchedulerConfig::new().with_poll_interval(Duration::from_millis(5)));
        assert!(config.reuse);
        assert_eq!(config.backend.mode, BackendMode::Sge);
        assert_eq!(config.scheduler.poll_interval_ms, 5);
    }
}
