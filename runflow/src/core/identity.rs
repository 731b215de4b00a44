//! Identifiers for runs, samples and jobs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Identifier of one end-to-end pipeline run.
///
/// Run ids contain only ASCII letters, digits and underscores so they can be
/// embedded in directory names and cluster job names unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Creates a validated run id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or contains characters other than
    /// letters, digits and underscores.
    pub fn new(id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfigError::new("run id cannot be empty"));
        }
        if let Some(bad) = id.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
            return Err(ConfigError::new(format!(
                "run id '{id}' contains '{bad}'; only letters, numbers and underscores are allowed"
            )));
        }
        Ok(Self(id))
    }

    /// Creates a run id from a run number.
    #[must_use]
    pub fn from_number(number: u64) -> Self {
        Self(number.to_string())
    }

    /// Returns the run number if this id is purely numeric.
    #[must_use]
    pub fn number(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Identity of a job: the stage it instantiates plus the sample it is bound
/// to, if any.
///
/// Ordering is lexical on `(stage, sample)`, with run-wide jobs sorting
/// before the per-sample jobs of the same stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    /// Stage name.
    pub stage: String,
    /// Sample the job is bound to; `None` for run-wide jobs.
    pub sample: Option<String>,
}

impl JobId {
    /// Creates the id of a run-wide job.
    #[must_use]
    pub fn run_wide(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sample: None,
        }
    }

    /// Creates the id of a per-sample job.
    #[must_use]
    pub fn per_sample(stage: impl Into<String>, sample: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sample: Some(sample.into()),
        }
    }

    /// Returns true if the job is not bound to a sample.
    #[must_use]
    pub fn is_run_wide(&self) -> bool {
        self.sample.is_none()
    }

    /// Returns a name safe to hand to a cluster scheduler as a job name.
    #[must_use]
    pub fn slug(&self) -> String {
        let raw = match &self.sample {
            Some(sample) => format!("{}.{}", self.stage, sample),
            None => self.stage.clone(),
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sample {
            Some(sample) => write!(f, "{}[{}]", self.stage, sample),
            None => f.write_str(&self.stage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_validation() {
        assert!(RunId::new("42").is_ok());
        assert!(RunId::new("mouse_liver_3").is_ok());
        assert!(RunId::new("").is_err());
        assert!(RunId::new("run-1").is_err());
        assert!(RunId::new("../etc").is_err());
    }

    #[test]
    fn test_run_id_number() {
        assert_eq!(RunId::from_number(7).number(), Some(7));
        assert_eq!(RunId::new("abc").unwrap().number(), None);
    }

    #[test]
    fn test_run_id_serde_validates() {
        let ok: RunId = serde_json::from_str(r#""12""#).unwrap();
        assert_eq!(ok.as_str(), "12");
        assert!(serde_json::from_str::<RunId>(r#""a b""#).is_err());
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId::run_wide("genome_index").to_string(), "genome_index");
        assert_eq!(JobId::per_sample("molecules", "s1").to_string(), "molecules[s1]");
    }

    #[test]
    fn test_job_id_ordering_is_lexical() {
        let mut ids = vec![
            JobId::per_sample("b", "s2"),
            JobId::per_sample("a", "s2"),
            JobId::per_sample("b", "s1"),
            JobId::run_wide("b"),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                JobId::per_sample("a", "s2"),
                JobId::run_wide("b"),
                JobId::per_sample("b", "s1"),
                JobId::per_sample("b", "s2"),
            ]
        );
    }

    #[test]
    fn test_job_id_slug() {
        assert_eq!(JobId::per_sample("align", "sample 1/x").slug(), "align.sample_1_x");
    }
}
