//! Per-run output namespaces.
//!
//! Every job writes into its own directory below the run directory:
//!
//! ```text
//! <output_root>/run_<run_id>/<sample or _run>/<stage>/
//! ```
//!
//! A run directory that already has content belongs to an earlier run and
//! is only written into again when reuse was requested.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::{JobId, RunId};
use crate::errors::{ErrorInfo, GraphConfigurationError, RunCollisionError, RunflowError};

/// Directory prefix of every run directory.
pub const RUN_DIR_PREFIX: &str = "run_";

/// Scope directory used by run-wide jobs.
pub const RUN_WIDE_DIR: &str = "_run";

/// Hands out job output directories and guards runs against collisions.
pub trait RunDirectoryManager: Send + Sync + fmt::Debug {
    /// Returns (and creates) the output directory of `job` in `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RunflowError::RunCollision`] if the run directory is
    /// already populated and reuse was not requested,
    /// [`RunflowError::GraphConfiguration`] if another job of the run was
    /// already given the same directory, or an IO error.
    fn allocate(&self, run_id: &RunId, job: &JobId) -> Result<PathBuf, RunflowError>;
}

/// Lays runs out on the local (or shared cluster) filesystem.
pub struct FsRunDirectoryManager {
    output_root: PathBuf,
    reuse: bool,
    claimed: Mutex<HashSet<RunId>>,
    allocated: Mutex<HashMap<PathBuf, JobId>>,
}

impl fmt::Debug for FsRunDirectoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsRunDirectoryManager")
            .field("output_root", &self.output_root)
            .field("reuse", &self.reuse)
            .finish_non_exhaustive()
    }
}

impl FsRunDirectoryManager {
    /// Creates a manager rooted at `output_root`.
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            reuse: false,
            claimed: Mutex::new(HashSet::new()),
            allocated: Mutex::new(HashMap::new()),
        }
    }

    /// Allows writing into populated run directories.
    #[must_use]
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Returns the output root.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Returns the directory of `run_id`.
    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.output_root.join(format!("{RUN_DIR_PREFIX}{run_id}"))
    }

    /// Returns where `job` writes, without touching the filesystem.
    #[must_use]
    pub fn job_dir(&self, run_id: &RunId, job: &JobId) -> PathBuf {
        let scope = job
            .sample
            .as_deref()
            .map_or_else(|| RUN_WIDE_DIR.to_string(), path_component);
        self.run_dir(run_id).join(scope).join(path_component(&job.stage))
    }

    /// Returns true if the run directory exists and has any entry.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be listed.
    pub fn is_populated(&self, run_id: &RunId) -> std::io::Result<bool> {
        match std::fs::read_dir(self.run_dir(run_id)) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Claims `run_id` for this manager, failing on a collision.
    ///
    /// Claiming twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RunflowError::RunCollision`] if the run directory is
    /// populated and reuse was not requested.
    pub fn claim(&self, run_id: &RunId) -> Result<PathBuf, RunflowError> {
        let mut claimed = self.claimed.lock();
        let run_dir = self.run_dir(run_id);
        if claimed.contains(run_id) {
            return Ok(run_dir);
        }
        if self.is_populated(run_id)? {
            if !self.reuse {
                return Err(RunCollisionError::new(run_id.clone(), run_dir).into());
            }
            info!(run_id = %run_id, path = %run_dir.display(), "reusing populated run directory");
        }
        std::fs::create_dir_all(&run_dir)?;
        claimed.insert(run_id.clone());
        Ok(run_dir)
    }

    /// Returns one more than the highest numeric run found under the root,
    /// or 1 if there is none.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root exists but cannot be listed.
    pub fn next_run_number(&self) -> std::io::Result<u64> {
        let entries = match std::fs::read_dir(&self.output_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(e),
        };

        let mut highest = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let number = name
                .to_str()
                .and_then(|n| n.strip_prefix(RUN_DIR_PREFIX))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(number) = number {
                highest = highest.max(number);
            }
        }
        Ok(highest + 1)
    }
}

impl RunDirectoryManager for FsRunDirectoryManager {
    fn allocate(&self, run_id: &RunId, job: &JobId) -> Result<PathBuf, RunflowError> {
        self.claim(run_id)?;
        let dir = self.job_dir(run_id, job);
        {
            let mut allocated = self.allocated.lock();
            match allocated.get(&dir) {
                Some(owner) if owner != job => {
                    return Err(GraphConfigurationError::new(format!(
                        "Jobs '{owner}' and '{job}' map to the same output directory {}",
                        dir.display()
                    ))
                    .with_error_info(
                        ErrorInfo::new("GRAPH-OUTPUT_DIR_CLASH", "Every job needs its own output directory")
                            .with_context_entry("directory", dir.display().to_string()),
                    )
                    .into());
                }
                Some(_) => {}
                None => {
                    allocated.insert(dir.clone(), job.clone());
                }
            }
        }
        std::fs::create_dir_all(&dir)?;
        debug!(job = %job, path = %dir.display(), "allocated job directory");
        Ok(dir)
    }
}

/// Maps an arbitrary name to a single safe path component.
///
/// Names made only of ASCII letters, digits, `_`, `-` and `.` (and not only
/// dots) map to themselves; anything else is replaced by `_`.
#[must_use]
pub fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let manager = FsRunDirectoryManager::new("/data");
        let run = RunId::from_number(4);
        assert_eq!(manager.run_dir(&run), PathBuf::from("/data/run_4"));
        assert_eq!(
            manager.job_dir(&run, &JobId::per_sample("reads", "s1")),
            PathBuf::from("/data/run_4/s1/reads")
        );
        assert_eq!(
            manager.job_dir(&run, &JobId::run_wide("genome_index")),
            PathBuf::from("/data/run_4/_run/genome_index")
        );
    }

    #[test]
    fn test_path_component_is_safe() {
        assert_eq!(path_component("a/b"), "a_b");
        assert_eq!(path_component(".."), "_..");
        assert_eq!(path_component("ok-1.x"), "ok-1.x");
    }

    #[test]
    fn test_allocate_creates_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = FsRunDirectoryManager::new(root.path());
        let run = RunId::from_number(1);

        let a = manager.allocate(&run, &JobId::per_sample("reads", "s1")).unwrap();
        let b = manager.allocate(&run, &JobId::run_wide("index")).unwrap();
        assert!(a.is_dir());
        assert!(b.is_dir());
        assert!(a.starts_with(root.path().join("run_1")));
    }

    #[test]
    fn test_populated_run_collides() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("run_3/s1")).unwrap();
        let manager = FsRunDirectoryManager::new(root.path());

        let err = manager
            .allocate(&RunId::from_number(3), &JobId::per_sample("reads", "s1"))
            .unwrap_err();
        assert!(matches!(err, RunflowError::RunCollision(_)));
    }

    #[test]
    fn test_empty_run_dir_is_not_a_collision() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("run_3")).unwrap();
        let manager = FsRunDirectoryManager::new(root.path());
        assert!(manager.allocate(&RunId::from_number(3), &JobId::run_wide("a")).is_ok());
    }

    #[test]
    fn test_reuse_allows_populated_run() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("run_3/s1")).unwrap();
        let manager = FsRunDirectoryManager::new(root.path()).with_reuse(true);
        assert!(manager
            .allocate(&RunId::from_number(3), &JobId::per_sample("reads", "s1"))
            .is_ok());
    }

    #[test]
    fn test_claimed_run_does_not_collide_with_itself() {
        let root = tempfile::tempdir().unwrap();
        let manager = FsRunDirectoryManager::new(root.path());
        let run = RunId::from_number(1);
        manager.allocate(&run, &JobId::run_wide("a")).unwrap();
        // The run directory is now populated by our own allocation.
        manager.allocate(&run, &JobId::run_wide("b")).unwrap();

        let other = FsRunDirectoryManager::new(root.path());
        assert!(other.allocate(&run, &JobId::run_wide("c")).is_err());
    }

    #[test]
    fn test_distinct_jobs_never_share_a_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = FsRunDirectoryManager::new(root.path());
        let run = RunId::from_number(1);

        let first = manager.allocate(&run, &JobId::per_sample("reads", "s/1")).unwrap();
        assert_eq!(first, root.path().join("run_1/s_1/reads"));
        // Allocating the same job again is fine.
        assert_eq!(manager.allocate(&run, &JobId::per_sample("reads", "s/1")).unwrap(), first);

        let err = manager
            .allocate(&run, &JobId::per_sample("reads", "s_1"))
            .unwrap_err();
        match err {
            RunflowError::GraphConfiguration(err) => {
                assert_eq!(err.code(), Some("GRAPH-OUTPUT_DIR_CLASH"));
            }
            other => panic!("expected a graph configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_next_run_number() {
        let root = tempfile::tempdir().unwrap();
        let manager = FsRunDirectoryManager::new(root.path().join("missing"));
        assert_eq!(manager.next_run_number().unwrap(), 1);

        let manager = FsRunDirectoryManager::new(root.path());
        for name in ["run_1", "run_7", "run_x", "other_9"] {
            std::fs::create_dir_all(root.path().join(name)).unwrap();
        }
        std::fs::write(root.path().join("run_99"), b"not a dir").unwrap();
        assert_eq!(manager.next_run_number().unwrap(), 8);
    }
}
