//! Logging setup and tracing spans.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::backend::BackendMode;
use crate::core::{JobId, RunId};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`.
///
/// `default_directive` (e.g. `"runflow=info"`) applies when `RUST_LOG` is
/// unset. Returns false if a subscriber was already installed.
pub fn init_tracing(format: LogFormat, default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init().is_ok(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init().is_ok(),
    }
}

/// Span covering one run.
#[must_use]
pub fn run_span(run_id: &RunId, backend: BackendMode) -> Span {
    tracing::info_span!("run", run_id = %run_id, backend = %backend)
}

/// Span covering one attempt of a job.
#[must_use]
pub fn job_span(job: &JobId, attempt: u32) -> Span {
    tracing::debug_span!("job", job = %job, attempt)
}

/// Wall-clock timer for log fields.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
