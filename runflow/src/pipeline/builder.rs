//! Expands stage definitions and samples into a validated job graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::{Job, JobGraph, StageDefinition, StageScope};
use crate::core::{JobId, RunId};
use crate::errors::{CycleDetectedError, ErrorInfo, GraphConfigurationError};
use crate::rundir::{path_component, RUN_WIDE_DIR};

/// Builder for the job graph of one run.
#[derive(Debug, Clone)]
pub struct JobGraphBuilder {
    run_id: RunId,
    stages: Vec<StageDefinition>,
    samples: Vec<String>,
}

impl JobGraphBuilder {
    /// Creates a builder for `run_id`.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            stages: Vec::new(),
            samples: Vec::new(),
        }
    }

    /// Adds a stage definition.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds several stage definitions.
    #[must_use]
    pub fn stages(mut self, stages: impl IntoIterator<Item = StageDefinition>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Adds an active sample.
    #[must_use]
    pub fn sample(mut self, sample: impl Into<String>) -> Self {
        self.samples.push(sample.into());
        self
    }

    /// Adds several active samples.
    #[must_use]
    pub fn samples(mut self, samples: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.samples.extend(samples.into_iter().map(Into::into));
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the definitions and instantiates every job.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphConfigurationError`] if the stage set is empty, a
    /// stage or sample is duplicated, a dependency is unknown or ambiguous,
    /// or the dependencies form a cycle. No jobs are created on error.
    pub fn build(self) -> Result<JobGraph, GraphConfigurationError> {
        if self.stages.is_empty() {
            return Err(GraphConfigurationError::new("Pipeline has no stages").with_error_info(
                ErrorInfo::new("GRAPH-EMPTY", "Cannot build a graph without stages")
                    .with_fix_hint("Add at least one stage definition."),
            ));
        }

        let mut by_name: HashMap<&str, &StageDefinition> = HashMap::new();
        for stage in &self.stages {
            stage.validate()?;
            if by_name.insert(stage.name.as_str(), stage).is_some() {
                return Err(GraphConfigurationError::new(format!(
                    "Stage '{}' is defined more than once",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
                .with_error_info(
                    ErrorInfo::new("GRAPH-DUPLICATE_STAGE", "Stage names must be unique")
                        .with_fix_hint("Rename one of the stages."),
                ));
            }
        }

        let mut seen_samples = HashSet::new();
        for sample in &self.samples {
            if sample.trim().is_empty() {
                return Err(GraphConfigurationError::new("Sample id cannot be empty").with_error_info(
                    ErrorInfo::new("GRAPH-INVALID_SAMPLE", "Sample ids must be non-empty"),
                ));
            }
            if !seen_samples.insert(sample.as_str()) {
                return Err(GraphConfigurationError::new(format!(
                    "Sample '{sample}' is listed more than once"
                ))
                .with_error_info(
                    ErrorInfo::new("GRAPH-DUPLICATE_SAMPLE", "Sample ids must be unique")
                        .with_context_entry("sample", sample.clone()),
                ));
            }
        }

        check_directory_names("Stage", self.stages.iter().map(|s| s.name.as_str()))?;
        check_directory_names("Sample", self.samples.iter().map(String::as_str))?;
        if let Some(sample) = self.samples.iter().find(|s| path_component(s) == RUN_WIDE_DIR) {
            return Err(GraphConfigurationError::new(format!(
                "Sample '{sample}' would share the run-wide output directory"
            ))
            .with_error_info(
                ErrorInfo::new("GRAPH-OUTPUT_DIR_CLASH", "Every job needs its own output directory")
                    .with_context_entry("sample", sample.clone())
                    .with_fix_hint(format!("Rename the sample; '{RUN_WIDE_DIR}' is reserved.")),
            ));
        }

        for stage in &self.stages {
            check_edges(stage, &by_name)?;
        }
        detect_cycles(&self.stages, &by_name)?;

        let jobs = self.instantiate(&by_name);
        JobGraph::new(self.run_id, jobs)
    }

    fn instantiate(&self, by_name: &HashMap<&str, &StageDefinition>) -> BTreeMap<JobId, Job> {
        let mut jobs = BTreeMap::new();

        for stage in &self.stages {
            let shared = Arc::new(stage.clone());
            match stage.scope {
                StageScope::PerRun => {
                    let mut deps = BTreeSet::new();
                    for upstream in &stage.dependencies {
                        deps.insert(JobId::run_wide(upstream.clone()));
                    }
                    for upstream in &stage.fan_in {
                        match by_name.get(upstream.as_str()).map(|s| s.scope) {
                            Some(StageScope::PerSample) => deps.extend(
                                self.samples
                                    .iter()
                                    .map(|sample| JobId::per_sample(upstream.clone(), sample.clone())),
                            ),
                            _ => {
                                deps.insert(JobId::run_wide(upstream.clone()));
                            }
                        }
                    }
                    let id = JobId::run_wide(stage.name.clone());
                    jobs.insert(id.clone(), Job::new(id, shared, deps));
                }
                StageScope::PerSample => {
                    for sample in &self.samples {
                        let deps = stage
                            .dependencies
                            .iter()
                            .map(|upstream| match by_name.get(upstream.as_str()).map(|s| s.scope) {
                                Some(StageScope::PerSample) => {
                                    JobId::per_sample(upstream.clone(), sample.clone())
                                }
                                _ => JobId::run_wide(upstream.clone()),
                            })
                            .collect();
                        let id = JobId::per_sample(stage.name.clone(), sample.clone());
                        jobs.insert(id.clone(), Job::new(id, shared.clone(), deps));
                    }
                }
            }
        }
        jobs
    }
}

/// Rejects distinct names that map to the same output directory component.
fn check_directory_names<'a>(
    kind: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), GraphConfigurationError> {
    let mut by_dir: HashMap<String, &str> = HashMap::new();
    for name in names {
        let dir = path_component(name);
        match by_dir.get(dir.as_str()) {
            Some(&other) if other != name => {
                return Err(GraphConfigurationError::new(format!(
                    "{kind} names '{other}' and '{name}' map to the same output directory '{dir}'"
                ))
                .with_error_info(
                    ErrorInfo::new("GRAPH-OUTPUT_DIR_CLASH", "Every job needs its own output directory")
                        .with_context_entry("directory", dir)
                        .with_fix_hint("Use names made of letters, digits, '_', '-' and '.'."),
                ));
            }
            Some(_) => {}
            None => {
                by_dir.insert(dir, name);
            }
        }
    }
    Ok(())
}

fn check_edges(
    stage: &StageDefinition,
    by_name: &HashMap<&str, &StageDefinition>,
) -> Result<(), GraphConfigurationError> {
    for dep in stage.upstream() {
        let Some(upstream) = by_name.get(dep.as_str()) else {
            return Err(GraphConfigurationError::new(format!(
                "Stage '{}' depends on unknown stage '{}'",
                stage.name, dep
            ))
            .with_stages(vec![stage.name.clone(), dep.clone()])
            .with_error_info(
                ErrorInfo::new("GRAPH-MISSING_DEP", format!("Dependency '{dep}' not found"))
                    .with_fix_hint("Define the upstream stage or remove the dependency."),
            ));
        };

        let plain = stage.dependencies.contains(dep);
        if plain && stage.scope == StageScope::PerRun && upstream.scope == StageScope::PerSample {
            return Err(GraphConfigurationError::new(format!(
                "Run-wide stage '{}' depends on per-sample stage '{}'; it is unclear which sample's job to wait for",
                stage.name, dep
            ))
            .with_stages(vec![stage.name.clone(), dep.clone()])
            .with_error_info(
                ErrorInfo::new(
                    "GRAPH-AMBIGUOUS_FAN_IN",
                    "A run-wide stage cannot implicitly depend on a per-sample stage",
                )
                .with_fix_hint("Declare the dependency with with_fan_in to wait for every sample."),
            ));
        }
    }
    Ok(())
}

fn detect_cycles(
    stages: &[StageDefinition],
    by_name: &HashMap<&str, &StageDefinition>,
) -> Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for stage in stages {
        if !visited.contains(stage.name.as_str()) {
            if let Some(cycle) = dfs_cycle(&stage.name, by_name, &mut visited, &mut rec_stack, &mut path) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }
    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    by_name: &HashMap<&'a str, &'a StageDefinition>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(&stage) = by_name.get(node) {
        for dep in stage.upstream() {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, by_name, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::CommandSpec;
    use pretty_assertions::assert_eq;

    fn cmd() -> CommandSpec {
        CommandSpec::new("true")
    }

    fn builder() -> JobGraphBuilder {
        JobGraphBuilder::new(RunId::from_number(1))
    }

    fn code(err: &GraphConfigurationError) -> &str {
        err.code().unwrap_or_default()
    }

    #[test]
    fn test_per_sample_and_run_wide_expansion() {
        let graph = builder()
            .stage(StageDefinition::per_run("genome_index", cmd()))
            .stage(StageDefinition::per_sample("molecules", cmd()).with_dependency("genome_index"))
            .stage(StageDefinition::per_sample("reads", cmd()).with_dependency("molecules"))
            .samples(["s1", "s2"])
            .build()
            .unwrap();

        assert_eq!(graph.len(), 5);
        let reads = graph.get(&JobId::per_sample("reads", "s2")).unwrap();
        assert_eq!(
            reads.dependencies().iter().cloned().collect::<Vec<_>>(),
            vec![JobId::per_sample("molecules", "s2")]
        );
        let molecules = graph.get(&JobId::per_sample("molecules", "s1")).unwrap();
        assert_eq!(
            molecules.dependencies().iter().cloned().collect::<Vec<_>>(),
            vec![JobId::run_wide("genome_index")]
        );
        assert_eq!(graph.topological_order()[0], JobId::run_wide("genome_index"));
    }

    #[test]
    fn test_every_edge_resolves() {
        let graph = builder()
            .stage(StageDefinition::per_run("a", cmd()))
            .stage(StageDefinition::per_sample("b", cmd()).with_dependency("a"))
            .stage(StageDefinition::per_sample("c", cmd()).with_dependencies(["a", "b"]))
            .stage(StageDefinition::per_run("d", cmd()).with_fan_in("c").with_dependency("a"))
            .samples(["x", "y", "z"])
            .build()
            .unwrap();

        for job in graph.jobs() {
            for dep in job.dependencies() {
                assert!(graph.get(dep).is_some(), "{dep} missing");
            }
        }
        assert_eq!(graph.topological_order().len(), graph.len());
    }

    #[test]
    fn test_fan_in_waits_for_every_sample() {
        let graph = builder()
            .stage(StageDefinition::per_sample("variants", cmd()))
            .stage(StageDefinition::per_run("compile", cmd()).with_fan_in("variants"))
            .samples(["s1", "s2", "s3"])
            .build()
            .unwrap();

        let compile = graph.get(&JobId::run_wide("compile")).unwrap();
        assert_eq!(compile.dependencies().len(), 3);
        assert_eq!(graph.transitive_dependents(&JobId::per_sample("variants", "s2")), vec![
            JobId::run_wide("compile")
        ]);
    }

    #[test]
    fn test_ambiguous_fan_in_is_rejected() {
        let err = builder()
            .stage(StageDefinition::per_sample("variants", cmd()))
            .stage(StageDefinition::per_run("compile", cmd()).with_dependency("variants"))
            .sample("s1")
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-AMBIGUOUS_FAN_IN");
        assert_eq!(err.stages, vec!["compile", "variants"]);
    }

    #[test]
    fn test_missing_dependency() {
        let err = builder()
            .stage(StageDefinition::per_sample("reads", cmd()).with_dependency("missing"))
            .sample("s1")
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-MISSING_DEP");
    }

    #[test]
    fn test_two_stage_cycle() {
        let err = builder()
            .stage(StageDefinition::per_run("a", cmd()).with_dependency("b"))
            .stage(StageDefinition::per_run("b", cmd()).with_dependency("a"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-CYCLE");
        assert_eq!(err.stages, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_longer_cycle_through_per_sample_stages() {
        let err = builder()
            .stage(StageDefinition::per_run("root", cmd()))
            .stage(StageDefinition::per_sample("a", cmd()).with_dependencies(["root", "c"]))
            .stage(StageDefinition::per_sample("b", cmd()).with_dependency("a"))
            .stage(StageDefinition::per_sample("c", cmd()).with_dependency("b"))
            .sample("s1")
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-CYCLE");
        assert_eq!(err.stages.first(), err.stages.last());
    }

    #[test]
    fn test_self_dependency() {
        let err = builder()
            .stage(StageDefinition::per_run("a", cmd()).with_dependency("a"))
            .build()
            .unwrap_err();
        assert!(err.message.contains("cannot depend on itself"));
    }

    #[test]
    fn test_duplicates_and_empty() {
        assert_eq!(code(&builder().build().unwrap_err()), "GRAPH-EMPTY");

        let err = builder()
            .stage(StageDefinition::per_run("a", cmd()))
            .stage(StageDefinition::per_run("a", cmd()))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-DUPLICATE_STAGE");

        let err = builder()
            .stage(StageDefinition::per_sample("a", cmd()))
            .samples(["s1", "s1"])
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-DUPLICATE_SAMPLE");
    }

    #[test]
    fn test_names_sharing_an_output_directory_are_rejected() {
        let err = builder()
            .stage(StageDefinition::per_sample("reads", cmd()))
            .samples(["s/1", "s_1"])
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-OUTPUT_DIR_CLASH");
        assert!(err.to_string().contains("s_1"));

        let err = builder()
            .stage(StageDefinition::per_run("qc report", cmd()))
            .stage(StageDefinition::per_run("qc_report", cmd()))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-OUTPUT_DIR_CLASH");

        let err = builder()
            .stage(StageDefinition::per_sample("reads", cmd()))
            .sample("_run")
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-OUTPUT_DIR_CLASH");

        assert!(builder()
            .stage(StageDefinition::per_sample("reads", cmd()))
            .samples(["s1", "s-1", "s.1"])
            .build()
            .is_ok());
    }

    #[test]
    fn test_fan_in_on_per_sample_stage_is_rejected() {
        let err = builder()
            .stage(StageDefinition::per_sample("a", cmd()))
            .stage(StageDefinition::per_sample("b", cmd()).with_fan_in("a"))
            .sample("s1")
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "GRAPH-FAN_IN");
    }

    #[test]
    fn test_jobs_start_pending() {
        let graph = builder()
            .stage(StageDefinition::per_sample("a", cmd()))
            .samples(["s1", "s2"])
            .build()
            .unwrap();
        assert_eq!(graph.count_in(crate::core::JobState::Pending), 2);
        assert!(!graph.is_resolved());
    }
}
