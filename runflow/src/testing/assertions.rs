//! Test assertions for run reports.

use crate::core::{JobId, JobState};
use crate::errors::FailureReason;
use crate::pipeline::{JobReport, RunOutcome, RunReport};

fn job_report<'a>(report: &'a RunReport, job: &JobId) -> &'a JobReport {
    report
        .job(job)
        .unwrap_or_else(|| panic!("Job '{job}' is not in the report"))
}

/// Asserts the overall outcome of the run.
pub fn assert_outcome(report: &RunReport, expected: RunOutcome) {
    assert_eq!(
        report.outcome, expected,
        "Expected run outcome {expected}, got {}. Jobs: {:?}",
        report.outcome,
        report.jobs.iter().map(|j| (j.job.to_string(), j.state)).collect::<Vec<_>>()
    );
}

/// Asserts the final state of one job.
pub fn assert_job_state(report: &RunReport, job: &JobId, expected: JobState) {
    let actual = job_report(report, job);
    assert_eq!(
        actual.state, expected,
        "Expected job '{job}' to be {expected}, got {} ({:?})",
        actual.state, actual.failure
    );
}

/// Asserts that every job succeeded.
pub fn assert_all_succeeded(report: &RunReport) {
    let failed: Vec<String> = report
        .jobs
        .iter()
        .filter(|j| j.state != JobState::Succeeded)
        .map(|j| format!("{} ({})", j.job, j.state))
        .collect();
    assert!(failed.is_empty(), "Expected every job to succeed; not succeeded: {failed:?}");
}

/// Asserts that a job was skipped because `origin` failed.
pub fn assert_skipped_by(report: &RunReport, job: &JobId, origin: &JobId) {
    let actual = job_report(report, job);
    assert_eq!(actual.state, JobState::Skipped, "Expected job '{job}' to be skipped");
    assert_eq!(
        actual.failure,
        Some(FailureReason::UpstreamFailed {
            origin: origin.clone()
        }),
        "Expected job '{job}' to be skipped because of '{origin}'"
    );
}

/// Asserts the number of attempts a job made.
pub fn assert_attempts(report: &RunReport, job: &JobId, expected: u32) {
    let actual = job_report(report, job);
    assert_eq!(
        actual.attempts, expected,
        "Expected job '{job}' to make {expected} attempts, got {}",
        actual.attempts
    );
}
