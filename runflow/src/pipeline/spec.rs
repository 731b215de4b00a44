//! Stage definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{OutputValidator, RetryPolicy};
use crate::core::ResourceClass;
use crate::errors::{ErrorInfo, GraphConfigurationError};
use crate::stages::JobTask;

/// Whether a stage runs once per sample or once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// One job per active sample.
    #[default]
    PerSample,
    /// A single job for the whole run (e.g. genome indexing).
    PerRun,
}

/// An external command line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// The program to execute.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Creates a command with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// The unit of work a stage wraps. Opaque to the scheduler.
#[derive(Debug, Clone)]
pub enum Executable {
    /// Run an external command.
    Command(CommandSpec),
    /// Run an in-process task (local backend only).
    Task(Arc<dyn JobTask>),
}

impl From<CommandSpec> for Executable {
    fn from(spec: CommandSpec) -> Self {
        Self::Command(spec)
    }
}

/// Immutable description of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// The unique name of the stage.
    pub name: String,
    /// Per-sample or per-run.
    pub scope: StageScope,
    /// Upstream stage names, in declaration order.
    pub dependencies: Vec<String>,
    /// Per-sample upstream stages a run-wide stage gathers across all samples.
    pub fan_in: Vec<String>,
    /// Concurrency class.
    pub resource_class: ResourceClass,
    /// Retry policy applied when a job of this stage fails.
    pub retry: RetryPolicy,
    /// Wall-clock budget per attempt.
    pub timeout: Option<Duration>,
    /// The work itself.
    pub executable: Executable,
    /// Checked after the backend reports success.
    pub output_validator: Option<Arc<dyn OutputValidator>>,
}

impl StageDefinition {
    /// Creates a new stage definition.
    #[must_use]
    pub fn new(name: impl Into<String>, scope: StageScope, executable: impl Into<Executable>) -> Self {
        Self {
            name: name.into(),
            scope,
            dependencies: Vec::new(),
            fan_in: Vec::new(),
            resource_class: ResourceClass::default(),
            retry: RetryPolicy::default(),
            timeout: None,
            executable: executable.into(),
            output_validator: None,
        }
    }

    /// Creates a stage instantiated once per sample.
    #[must_use]
    pub fn per_sample(name: impl Into<String>, executable: impl Into<Executable>) -> Self {
        Self::new(name, StageScope::PerSample, executable)
    }

    /// Creates a stage instantiated once per run.
    #[must_use]
    pub fn per_run(name: impl Into<String>, executable: impl Into<Executable>) -> Self {
        Self::new(name, StageScope::PerRun, executable)
    }

    /// Creates a stage wrapping an in-process task.
    #[must_use]
    pub fn task(name: impl Into<String>, scope: StageScope, task: Arc<dyn JobTask>) -> Self {
        Self::new(name, scope, Executable::Task(task))
    }

    /// Adds a dependency. Duplicates are ignored.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    /// Adds several dependencies.
    #[must_use]
    pub fn with_dependencies(self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        deps.into_iter().fold(self, Self::with_dependency)
    }

    /// Declares that this run-wide stage waits for every sample's job of a
    /// per-sample stage.
    #[must_use]
    pub fn with_fan_in(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.fan_in.contains(&dep) {
            self.fan_in.push(dep);
        }
        self
    }

    /// Sets the resource class.
    #[must_use]
    pub fn with_resource_class(mut self, class: impl Into<ResourceClass>) -> Self {
        self.resource_class = class.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the wall-clock budget per attempt.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requires each job's output to pass `validator` before it counts as
    /// succeeded.
    #[must_use]
    pub fn with_output_validator(mut self, validator: impl OutputValidator + 'static) -> Self {
        self.output_validator = Some(Arc::new(validator));
        self
    }

    /// Every upstream stage name, plain and fan-in.
    pub fn upstream(&self) -> impl Iterator<Item = &String> {
        self.dependencies.iter().chain(self.fan_in.iter())
    }

    /// Validates the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank, the stage depends on itself,
    /// or a per-sample stage declares fan-in dependencies.
    pub fn validate(&self) -> Result<(), GraphConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(GraphConfigurationError::new("Stage name cannot be empty"));
        }
        if self.upstream().any(|dep| dep == &self.name) {
            return Err(GraphConfigurationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        if self.scope == StageScope::PerSample && !self.fan_in.is_empty() {
            return Err(GraphConfigurationError::new(format!(
                "Per-sample stage '{}' cannot declare fan-in dependencies",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ErrorInfo::new("GRAPH-FAN_IN", "Fan-in is only meaningful for run-wide stages")
                    .with_fix_hint("Use with_dependency for same-sample edges."),
            ));
        }
        Ok(())
    }
}
