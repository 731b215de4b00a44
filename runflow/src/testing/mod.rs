//! Testing utilities for runflow pipelines.
//!
//! This module provides:
//! - A scripted backend that plays back per-job outcomes
//! - Fast scheduler configurations and canned stage sets
//! - Assertions over run reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_all_succeeded, assert_attempts, assert_job_state, assert_outcome, assert_skipped_by,
};
pub use fixtures::{
    chain, fast_scheduler_config, independent, noop_stage, simulation_stages, test_run_config,
};
pub use mocks::{ScriptedBackend, ScriptedOutcome};
