//! Resource classes and the cluster resource requests they map to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A concurrency label such as `light` or `heavy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceClass(String);

impl ResourceClass {
    /// Creates a resource class.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The class assigned to stages that do not declare one.
    #[must_use]
    pub fn default_class() -> Self {
        Self::new("default")
    }

    /// Returns the class name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ResourceClass {
    fn default() -> Self {
        Self::default_class()
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceClass {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a job asks a cluster scheduler for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Number of cores.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Memory in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Queue override for this class.
    #[serde(default)]
    pub queue: Option<String>,
}

fn default_cpus() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    6000
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            queue: None,
        }
    }
}

impl ResourceRequest {
    /// Creates a request with the given cores and memory.
    #[must_use]
    pub fn new(cpus: u32, memory_mb: u64) -> Self {
        Self {
            cpus,
            memory_mb,
            queue: None,
        }
    }

    /// Sets the queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}
