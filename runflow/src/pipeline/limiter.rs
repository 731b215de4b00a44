//! Global and per-class ceilings on in-flight jobs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::core::ResourceClass;

/// Concurrency ceilings. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum in-flight jobs overall.
    #[serde(default)]
    pub global_limit: Option<usize>,
    /// Maximum in-flight jobs per resource class.
    #[serde(default)]
    pub class_limits: BTreeMap<ResourceClass, usize>,
}

impl LimiterConfig {
    /// Creates an unbounded configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the global ceiling.
    #[must_use]
    pub fn with_global_limit(mut self, limit: usize) -> Self {
        self.global_limit = Some(limit);
        self
    }

    /// Sets the ceiling for one class.
    #[must_use]
    pub fn with_class_limit(mut self, class: impl Into<ResourceClass>, limit: usize) -> Self {
        self.class_limits.insert(class.into(), limit);
        self
    }
}

#[derive(Debug, Default)]
struct Counts {
    global: usize,
    per_class: HashMap<ResourceClass, usize>,
}

/// Admits jobs while both the global and the class ceiling have headroom.
///
/// Check and increment happen under one lock, so concurrent callers can
/// never overshoot a ceiling.
#[derive(Debug, Default)]
pub struct ConcurrencyLimiter {
    config: LimiterConfig,
    counts: Mutex<Counts>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Takes a slot for `class` if one is free.
    pub fn try_admit(&self, class: &ResourceClass) -> bool {
        let mut counts = self.counts.lock();
        if self.config.global_limit.is_some_and(|limit| counts.global >= limit) {
            return false;
        }
        let in_class = counts.per_class.get(class).copied().unwrap_or(0);
        if self
            .config
            .class_limits
            .get(class)
            .is_some_and(|&limit| in_class >= limit)
        {
            return false;
        }
        counts.global += 1;
        *counts.per_class.entry(class.clone()).or_insert(0) += 1;
        true
    }

    /// Returns a slot taken by [`try_admit`](Self::try_admit).
    pub fn release(&self, class: &ResourceClass) {
        let mut counts = self.counts.lock();
        let Some(in_class) = counts.per_class.get_mut(class) else {
            return;
        };
        if *in_class == 0 {
            return;
        }
        *in_class -= 1;
        counts.global = counts.global.saturating_sub(1);
    }

    /// Returns true if `class` could be admitted right now.
    #[must_use]
    pub fn has_headroom(&self, class: &ResourceClass) -> bool {
        let counts = self.counts.lock();
        let global_ok = self.config.global_limit.map_or(true, |limit| counts.global < limit);
        let class_ok = self.config.class_limits.get(class).map_or(true, |&limit| {
            counts.per_class.get(class).copied().unwrap_or(0) < limit
        });
        global_ok && class_ok
    }

    /// Returns the number of admitted, unreleased jobs.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.counts.lock().global
    }

    /// Returns the number of admitted, unreleased jobs of `class`.
    #[must_use]
    pub fn in_flight_for(&self, class: &ResourceClass) -> usize {
        self.counts.lock().per_class.get(class).copied().unwrap_or(0)
    }
}
