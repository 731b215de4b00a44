//! Lifecycle events emitted by the scheduler.
//!
//! Events are a type string plus an optional JSON payload. Job events always
//! carry a `job` field holding the job's display id.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// The run began executing.
pub const RUN_STARTED: &str = "run.started";
/// A job's dependencies all succeeded (or its backoff elapsed).
pub const JOB_READY: &str = "job.ready";
/// A job was handed to the backend.
pub const JOB_SUBMITTED: &str = "job.submitted";
/// The backend reported the job as executing.
pub const JOB_RUNNING: &str = "job.running";
/// A job finished successfully.
pub const JOB_SUCCEEDED: &str = "job.succeeded";
/// An attempt failed.
pub const JOB_FAILED: &str = "job.failed";
/// A failed job will be retried after a delay.
pub const JOB_RETRY_SCHEDULED: &str = "job.retry_scheduled";
/// A job will never run (again).
pub const JOB_SKIPPED: &str = "job.skipped";
/// Every job resolved without an abort.
pub const RUN_COMPLETED: &str = "run.completed";
/// The run was cancelled.
pub const RUN_ABORTED: &str = "run.aborted";

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sinks_are_object_safe() {
        let collecting = Arc::new(CollectingEventSink::new());
        let sinks: Vec<Arc<dyn EventSink>> = vec![
            Arc::new(NoOpEventSink),
            Arc::new(LoggingEventSink::default()),
            collecting.clone(),
        ];
        for sink in sinks {
            sink.emit(RUN_STARTED, None);
            sink.emit(JOB_READY, Some(serde_json::json!({"job": "a"})));
        }
        assert_eq!(collecting.event_types(), vec![RUN_STARTED, JOB_READY]);
    }
}
