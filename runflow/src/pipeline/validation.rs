//! Post-exit output checks.
//!
//! A backend only knows whether a job's process exited cleanly. A stage can
//! additionally attach an [`OutputValidator`]; the job then only counts as
//! succeeded once its output directory passes the check. A failed check is
//! an ordinary failed attempt, so the stage's retry policy applies.

use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};

use crate::core::JobId;

/// Last log line written by steps that finished all of their work.
pub const COMPLETION_SENTINEL: &str = "ALL DONE!";

/// Checks a job's output after the backend reported success.
pub trait OutputValidator: Send + Sync + Debug {
    /// Returns `Err` with a description of what is missing or malformed.
    fn validate(&self, job: &JobId, output_dir: &Path) -> Result<(), String>;
}

/// Requires a set of files and, optionally, a completion line at the end of
/// a log file. Paths are relative to the job's output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedOutputs {
    files: Vec<PathBuf>,
    sentinel: Option<(PathBuf, String)>,
}

impl ExpectedOutputs {
    /// Creates a check that requires nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `path` to exist as a regular file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Requires the last line of `log` to be `line` (trailing whitespace
    /// ignored).
    #[must_use]
    pub fn with_log_sentinel(mut self, log: impl Into<PathBuf>, line: impl Into<String>) -> Self {
        self.sentinel = Some((log.into(), line.into()));
        self
    }

    /// Requires the last line of `log` to be [`COMPLETION_SENTINEL`].
    #[must_use]
    pub fn with_completion_log(self, log: impl Into<PathBuf>) -> Self {
        self.with_log_sentinel(log, COMPLETION_SENTINEL)
    }
}

impl OutputValidator for ExpectedOutputs {
    fn validate(&self, _job: &JobId, output_dir: &Path) -> Result<(), String> {
        for file in &self.files {
            let path = output_dir.join(file);
            if !path.is_file() {
                return Err(format!("missing output file {}", path.display()));
            }
        }

        if let Some((log, expected)) = &self.sentinel {
            let path = output_dir.join(log);
            let content = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read log {}: {e}", path.display()))?;
            let last = content.lines().last().map_or("", str::trim_end);
            if last != expected {
                return Err(format!(
                    "log {} does not end with '{expected}' (last line: '{last}')",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

/// A validator backed by a closure.
pub struct FnValidator<F>
where
    F: Fn(&JobId, &Path) -> Result<(), String> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&JobId, &Path) -> Result<(), String> + Send + Sync,
{
    /// Creates a new function-based validator.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnValidator<F>
where
    F: Fn(&JobId, &Path) -> Result<(), String> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").field("name", &self.name).finish()
    }
}

impl<F> OutputValidator for FnValidator<F>
where
    F: Fn(&JobId, &Path) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, job: &JobId, output_dir: &Path) -> Result<(), String> {
        (self.func)(job, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobId {
        JobId::per_sample("update_annotation", "s1")
    }

    #[test]
    fn test_empty_expectation_passes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ExpectedOutputs::new().validate(&job(), dir.path()).is_ok());
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let check = ExpectedOutputs::new().with_file("annotation.gtf");

        let err = check.validate(&job(), dir.path()).unwrap_err();
        assert!(err.contains("annotation.gtf"));

        std::fs::write(dir.path().join("annotation.gtf"), "chr1\n").unwrap();
        assert!(check.validate(&job(), dir.path()).is_ok());
    }

    #[test]
    fn test_completion_log_must_end_with_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let check = ExpectedOutputs::new().with_completion_log("update.log");

        assert!(check.validate(&job(), dir.path()).unwrap_err().contains("cannot read log"));

        std::fs::write(dir.path().join("update.log"), "processing chr1\n").unwrap();
        let err = check.validate(&job(), dir.path()).unwrap_err();
        assert!(err.contains("processing chr1"));

        std::fs::write(dir.path().join("update.log"), "processing chr1\nALL DONE!").unwrap();
        assert!(check.validate(&job(), dir.path()).is_ok());

        std::fs::write(dir.path().join("update.log"), "processing chr1\nALL DONE!  \n").unwrap();
        assert!(check.validate(&job(), dir.path()).is_ok());

        // The sentinel has to be the very last line.
        std::fs::write(dir.path().join("update.log"), "ALL DONE!\n\n").unwrap();
        assert!(check.validate(&job(), dir.path()).is_err());
    }

    #[test]
    fn test_fn_validator_sees_job_and_dir() {
        let validator = FnValidator::new("sample only", |job: &JobId, dir: &Path| {
            if job.sample.is_some() && dir.ends_with("out") {
                Ok(())
            } else {
                Err("unexpected".to_string())
            }
        });
        assert!(validator.validate(&job(), Path::new("/tmp/out")).is_ok());
        assert!(validator.validate(&JobId::run_wide("x"), Path::new("/tmp/out")).is_err());
        assert!(format!("{validator:?}").contains("sample only"));
    }
}
