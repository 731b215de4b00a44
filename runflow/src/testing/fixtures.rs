//! Canned configurations and stage sets for tests.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{RunConfig, SchedulerConfig};
use crate::core::RunId;
use crate::pipeline::{CommandSpec, StageDefinition};

/// Scheduler settings that keep tests fast: 5 ms poll interval, one
/// second cancellation timeout.
#[must_use]
pub fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_poll_interval(Duration::from_millis(5))
        .with_cancel_timeout(Duration::from_secs(1))
}

/// A run configuration using [`fast_scheduler_config`].
#[must_use]
pub fn test_run_config(run_number: u64, output_root: impl Into<PathBuf>) -> RunConfig {
    RunConfig::new(RunId::from_number(run_number), output_root).with_scheduler(fast_scheduler_config())
}

/// A run-wide stage that runs `true`.
#[must_use]
pub fn noop_stage(name: &str) -> StageDefinition {
    StageDefinition::per_run(name, CommandSpec::new("true"))
}

/// Run-wide stages where each depends on the previous one.
#[must_use]
pub fn chain(names: &[&str]) -> Vec<StageDefinition> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let stage = noop_stage(name);
            match i.checked_sub(1) {
                Some(prev) => stage.with_dependency(names[prev]),
                None => stage,
            }
        })
        .collect()
}

/// Run-wide stages without dependencies.
#[must_use]
pub fn independent(names: &[&str]) -> Vec<StageDefinition> {
    names.iter().map(|name| noop_stage(name)).collect()
}

/// The shape of a read-simulation run: one genome index, per-sample read
/// and molecule simulation, and a run-wide summary over every sample.
#[must_use]
pub fn simulation_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::per_run("genome_index", CommandSpec::new("true")),
        StageDefinition::per_sample("molecules", CommandSpec::new("true")),
        StageDefinition::per_sample("reads", CommandSpec::new("true"))
            .with_dependencies(["genome_index", "molecules"]),
        StageDefinition::per_run("summary", CommandSpec::new("true")).with_fan_in("reads"),
    ]
}
