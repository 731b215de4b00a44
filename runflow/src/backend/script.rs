//! Job scripts handed to cluster schedulers.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::JobRequest;
use crate::core::{ResourceClass, ResourceRequest};
use crate::errors::SubmissionError;
use crate::pipeline::Executable;

/// Name of the script file written into the job's output directory.
pub const JOB_SCRIPT_FILE_NAME: &str = "job.sh";

/// Quotes `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Renders the shell script that runs `request` on a cluster node.
///
/// # Errors
///
/// Returns an error for in-process tasks, which cannot leave this process.
pub fn render_job_script(request: &JobRequest) -> Result<String, SubmissionError> {
    let Executable::Command(cmd) = &request.executable else {
        return Err(SubmissionError::new(
            request.job.clone(),
            "in-process tasks can only run on the local backend",
        ));
    };

    let mut script = String::from("#!/bin/bash\n");
    let _ = writeln!(
        script,
        "# runflow job {} (attempt {}) of run {}",
        request.job, request.attempt, request.run_id
    );
    let _ = writeln!(script, "cd {}", shell_quote(&request.output_dir.display().to_string()));
    for (key, value) in request.environment() {
        let _ = writeln!(script, "export {key}={}", shell_quote(&value));
    }

    let mut line = shell_quote(&cmd.program);
    for arg in &cmd.args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    let _ = writeln!(script, "exec {line}");
    Ok(script)
}

/// Scheduler-visible job name. Starts with a letter, as SGE requires.
pub(crate) fn cluster_job_name(request: &JobRequest) -> String {
    format!("rf{}_{}", request.run_id, request.job.slug())
}

/// Looks up the cluster request for the job's resource class.
pub(crate) fn resource_request(
    classes: &BTreeMap<ResourceClass, ResourceRequest>,
    request: &JobRequest,
) -> ResourceRequest {
    classes.get(&request.resource_class).cloned().unwrap_or_default()
}

/// Writes the job script into the output directory and makes it executable.
pub(crate) async fn write_job_script(request: &JobRequest) -> Result<PathBuf, SubmissionError> {
    let script = render_job_script(request)?;
    let path = request.output_dir.join(JOB_SCRIPT_FILE_NAME);
    let io_err = |e: std::io::Error, what: &str, path: &Path| {
        SubmissionError::new(
            request.job.clone(),
            format!("failed to {what} `{}`: {e}", path.display()),
        )
    };

    tokio::fs::create_dir_all(&request.output_dir)
        .await
        .map_err(|e| io_err(e, "create output directory", &request.output_dir))?;
    tokio::fs::write(&path, script)
        .await
        .map_err(|e| io_err(e, "write job script", &path))?;
    #[cfg(unix)]
    tokio::fs::set_permissions(
        &path,
        <std::fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o755),
    )
    .await
    .map_err(|e| io_err(e, "set permissions on", &path))?;

    Ok(path)
}
