//! Error types for runflow.
//!
//! Configuration and collision errors abort a run before anything is
//! submitted. Per-job failures are not errors at this level: they are
//! recorded as a [`FailureReason`] on the job and handled by the retry
//! policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::{JobId, JobState, RunId};

/// The main error type for runflow operations.
#[derive(Debug, Error)]
pub enum RunflowError {
    /// The stage definitions do not form a valid job graph.
    #[error("{0}")]
    GraphConfiguration(#[from] GraphConfigurationError),

    /// The run's output directory is already in use.
    #[error("{0}")]
    RunCollision(#[from] RunCollisionError),

    /// A backend rejected a job.
    #[error("{0}")]
    Submission(#[from] SubmissionError),

    /// A backend status query failed.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// A job was asked to make an illegal state change.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// The run configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The scheduler reached an inconsistent state.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Diagnostic metadata attached to graph configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when stage definitions cannot be expanded into a job graph.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl GraphConfigurationError {
    /// Creates a new graph configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a dependency cycle is found.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages (or jobs) forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for GraphConfigurationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error raised when a run's output root is already populated.
#[derive(Debug, Clone, Error)]
#[error("Run '{run_id}' already has output at {}; choose another run id or request reuse", path.display())]
pub struct RunCollisionError {
    /// The colliding run.
    pub run_id: RunId,
    /// The populated output root.
    pub path: PathBuf,
}

impl RunCollisionError {
    /// Creates a new run collision error.
    #[must_use]
    pub fn new(run_id: RunId, path: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            path: path.into(),
        }
    }
}

/// Error raised when a backend refuses to accept a job.
#[derive(Debug, Clone, Error)]
#[error("Submission of '{job}' failed: {message}")]
pub struct SubmissionError {
    /// The job being submitted.
    pub job: JobId,
    /// What went wrong.
    pub message: String,
}

impl SubmissionError {
    /// Creates a new submission error.
    #[must_use]
    pub fn new(job: JobId, message: impl Into<String>) -> Self {
        Self {
            job,
            message: message.into(),
        }
    }
}

/// Error raised when a status query could not be answered.
///
/// These are treated as transient by the scheduler.
#[derive(Debug, Clone, Error)]
#[error("Backend query failed for handle '{handle}': {message}")]
pub struct BackendError {
    /// The backend-side id that was queried.
    pub handle: String,
    /// What went wrong.
    pub message: String,
}

impl BackendError {
    /// Creates a new backend error.
    #[must_use]
    pub fn new(handle: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            message: message.into(),
        }
    }
}

/// Error raised on an illegal job state change.
#[derive(Debug, Clone, Error)]
#[error("Illegal transition for job '{job}': {from} -> {to}")]
pub struct InvalidTransitionError {
    /// The job.
    pub job: JobId,
    /// Current state.
    pub from: JobState,
    /// Requested state.
    pub to: JobState,
}

/// Error raised for invalid configuration values.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration: {message}")]
pub struct ConfigError {
    /// What is wrong.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend rejected the job at submit time.
    Submission {
        /// Backend message.
        message: String,
    },
    /// The job ran and reported non-success.
    Execution {
        /// Exit code, when the backend knows it.
        exit_code: Option<i32>,
        /// Backend message.
        message: String,
    },
    /// The backend reported success but the output failed its check.
    InvalidOutput {
        /// What the check found.
        message: String,
    },
    /// The job exceeded its wall-clock budget.
    Timeout {
        /// The budget in milliseconds.
        limit_ms: u64,
    },
    /// The backend repeatedly failed to report the job's status.
    Lost {
        /// Last backend error.
        message: String,
    },
    /// An ancestor failed permanently.
    UpstreamFailed {
        /// The ancestor whose failure caused the skip.
        origin: JobId,
    },
    /// The run was aborted before the job resolved.
    Cancelled {
        /// Abort reason.
        reason: String,
    },
}

impl FailureReason {
    /// Returns true if this job is where a failure originated, as opposed to
    /// being collateral of an upstream failure or an abort.
    #[must_use]
    pub fn is_origin(&self) -> bool {
        !matches!(self, Self::UpstreamFailed { .. } | Self::Cancelled { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submission { message } => write!(f, "submission failed: {message}"),
            Self::Execution {
                exit_code: Some(code),
                message,
            } => write!(f, "exited with code {code}: {message}"),
            Self::Execution {
                exit_code: None,
                message,
            } => write!(f, "execution failed: {message}"),
            Self::InvalidOutput { message } => write!(f, "invalid output: {message}"),
            Self::Timeout { limit_ms } => write!(f, "timed out after {limit_ms} ms"),
            Self::Lost { message } => write!(f, "lost track of job: {message}"),
            Self::UpstreamFailed { origin } => write!(f, "upstream job '{origin}' failed"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Result type for runflow operations.
pub type Result<T> = std::result::Result<T, RunflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_converts_to_graph_error() {
        let err: GraphConfigurationError =
            CycleDetectedError::new(vec!["a".into(), "b".into(), "a".into()]).into();
        assert_eq!(err.code(), Some("GRAPH-CYCLE"));
        assert_eq!(err.stages, vec!["a", "b", "a"]);
        assert!(err.message.contains("a -> b -> a"));
    }

    #[test]
    fn test_run_collision_message() {
        let err = RunCollisionError::new(RunId::from_number(3), "/data/run_3");
        assert!(err.to_string().contains("Run '3'"));
        assert!(err.to_string().contains("/data/run_3"));
    }

    #[test]
    fn test_failure_reason_origin() {
        assert!(FailureReason::Timeout { limit_ms: 5 }.is_origin());
        assert!(FailureReason::InvalidOutput {
            message: "missing reads.fa".into()
        }
        .is_origin());
        assert!(!FailureReason::UpstreamFailed {
            origin: JobId::run_wide("a")
        }
        .is_origin());
        assert!(!FailureReason::Cancelled {
            reason: "operator".into()
        }
        .is_origin());
    }

    #[test]
    fn test_failure_reason_serialize() {
        let reason = FailureReason::Execution {
            exit_code: Some(2),
            message: "boom".into(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "execution");
        assert_eq!(json["exit_code"], 2);
        assert_eq!(reason.to_string(), "exited with code 2: boom");
    }

    #[test]
    fn test_umbrella_conversion() {
        let err: RunflowError = ConfigError::new("bad").into();
        assert!(matches!(err, RunflowError::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: bad");
    }
}
