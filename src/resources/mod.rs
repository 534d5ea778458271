//! Resource profile construction
//!
//! Merges per-job resource hints (the job-options vocabulary, e.g.
//! `executor-memory`) over the configured defaults and validates the result.
//! Building a profile is pure: no I/O, same inputs give the same profile.

mod memory;

pub use memory::{MemoryParseError, MemorySize};

use serde::{Deserialize, Serialize};

use crate::config::ResourceDefaults;
use crate::error::ConfigurationError;

/// Soft-error ratio used when a job simply asks for `"soft-errors": true`
pub const DEFAULT_SOFT_ERRORS_RATIO: f64 = 0.1;

/// A memory hint as it appears in job options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryHint {
    Text(String),
    Mib(u64),
}

/// Soft-error tolerance as it appears in job options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SoftErrors {
    Flag(bool),
    Ratio(f64),
}

/// Caller-supplied resource hints; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(rename = "driver-memory", alias = "driverMemory", alias = "driver_memory")]
    pub driver_memory: Option<MemoryHint>,

    #[serde(
        rename = "driver-memoryOverhead",
        alias = "driverMemoryOverhead",
        alias = "driver_memory_overhead"
    )]
    pub driver_memory_overhead: Option<MemoryHint>,

    #[serde(rename = "executor-memory", alias = "executorMemory", alias = "executor_memory")]
    pub executor_memory: Option<MemoryHint>,

    #[serde(
        rename = "executor-memoryOverhead",
        alias = "executorMemoryOverhead",
        alias = "executor_memory_overhead"
    )]
    pub executor_memory_overhead: Option<MemoryHint>,

    #[serde(rename = "driver-cores", alias = "driverCores", alias = "driver_cores")]
    pub driver_cores: Option<u32>,

    #[serde(rename = "executor-cores", alias = "executorCores", alias = "executor_cores")]
    pub executor_cores: Option<u32>,

    #[serde(
        rename = "task-cpus",
        alias = "taskCpus",
        alias = "taskCores",
        alias = "task_cores"
    )]
    pub task_cores: Option<u32>,

    #[serde(
        rename = "max-executors",
        alias = "maxExecutors",
        alias = "maxWorkers",
        alias = "max_workers"
    )]
    pub max_workers: Option<u32>,

    pub queue: Option<String>,

    #[serde(rename = "soft-errors", alias = "softErrors", alias = "maxSoftErrorsRatio")]
    pub soft_errors: Option<SoftErrors>,

    pub profile: Option<bool>,

    #[serde(rename = "logging-threshold", alias = "loggingThreshold")]
    pub logging_threshold: Option<String>,
}

/// Validated resource request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub driver_memory: MemorySize,
    pub driver_memory_overhead: MemorySize,
    pub executor_memory: MemorySize,
    pub executor_memory_overhead: MemorySize,
    pub driver_cores: u32,
    pub executor_cores: u32,
    pub task_cores: u32,
    pub min_workers: u32,
    pub max_workers: u32,
    pub queue: String,
    pub max_soft_errors_ratio: f64,

    /// Collect interpreter profiles of the job
    pub profile: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging_threshold: Option<String>,
}

impl ResourceProfile {
    /// Check the numeric invariants of a profile.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let memories = [
            ("driver_memory", self.driver_memory),
            ("driver_memory_overhead", self.driver_memory_overhead),
            ("executor_memory", self.executor_memory),
            ("executor_memory_overhead", self.executor_memory_overhead),
        ];
        for (field, size) in memories {
            if size.is_zero() {
                return Err(ConfigurationError::new(field, "must be greater than zero"));
            }
        }

        let cores = [
            ("driver_cores", self.driver_cores),
            ("executor_cores", self.executor_cores),
            ("task_cores", self.task_cores),
        ];
        for (field, count) in cores {
            if count == 0 {
                return Err(ConfigurationError::new(field, "must be greater than zero"));
            }
        }

        if self.task_cores > self.executor_cores {
            return Err(ConfigurationError::new(
                "task_cores",
                format!(
                    "{} exceeds executor_cores ({})",
                    self.task_cores, self.executor_cores
                ),
            ));
        }

        if self.max_workers == 0 {
            return Err(ConfigurationError::new("max_workers", "must be greater than zero"));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigurationError::new(
                "max_workers",
                format!(
                    "{} is below the minimum worker count ({})",
                    self.max_workers, self.min_workers
                ),
            ));
        }

        if self.queue.trim().is_empty() {
            return Err(ConfigurationError::new("queue", "must not be empty"));
        }

        let ratio = self.max_soft_errors_ratio;
        if ratio.is_nan() || !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigurationError::new(
                "max_soft_errors_ratio",
                format!("{} is outside [0, 1]", ratio),
            ));
        }

        Ok(())
    }
}

/// Turns hints plus defaults into a validated [`ResourceProfile`]
#[derive(Debug, Clone)]
pub struct ResourceConfigBuilder {
    defaults: ResourceDefaults,
}

impl ResourceConfigBuilder {
    pub fn new(defaults: ResourceDefaults) -> Self {
        Self { defaults }
    }

    /// Merge `hints` over the defaults field by field and validate.
    pub fn build(&self, hints: &ResourceHints) -> Result<ResourceProfile, ConfigurationError> {
        let d = &self.defaults;

        let max_workers = match hints.max_workers {
            Some(requested) if requested > d.max_workers_ceiling => {
                tracing::warn!(
                    requested,
                    ceiling = d.max_workers_ceiling,
                    "max-executors capped to the configured ceiling"
                );
                d.max_workers_ceiling
            }
            Some(requested) => requested,
            None => d.max_workers_ceiling,
        };

        let max_soft_errors_ratio = match hints.soft_errors {
            Some(SoftErrors::Flag(true)) => DEFAULT_SOFT_ERRORS_RATIO,
            Some(SoftErrors::Flag(false)) => 0.0,
            Some(SoftErrors::Ratio(ratio)) => ratio,
            None => d.max_soft_errors_ratio,
        };

        let profile = ResourceProfile {
            driver_memory: memory_hint("driver-memory", &hints.driver_memory, d.driver_memory)?,
            driver_memory_overhead: memory_hint(
                "driver-memoryOverhead",
                &hints.driver_memory_overhead,
                d.driver_memory_overhead,
            )?,
            executor_memory: memory_hint(
                "executor-memory",
                &hints.executor_memory,
                d.executor_memory,
            )?,
            executor_memory_overhead: memory_hint(
                "executor-memoryOverhead",
                &hints.executor_memory_overhead,
                d.executor_memory_overhead,
            )?,
            driver_cores: hints.driver_cores.unwrap_or(d.driver_cores),
            executor_cores: hints.executor_cores.unwrap_or(d.executor_cores),
            task_cores: hints.task_cores.unwrap_or(d.task_cores),
            min_workers: d.min_workers,
            max_workers,
            queue: hints.queue.clone().unwrap_or_else(|| d.queue.clone()),
            max_soft_errors_ratio,
            profile: hints.profile.unwrap_or(false),
            logging_threshold: hints
                .logging_threshold
                .as_ref()
                .map(|level| level.trim().to_ascii_lowercase()),
        };

        profile.validate()?;
        Ok(profile)
    }
}

fn memory_hint(
    field: &str,
    hint: &Option<MemoryHint>,
    default: MemorySize,
) -> Result<MemorySize, ConfigurationError> {
    match hint {
        None => Ok(default),
        Some(MemoryHint::Mib(mib)) => MemorySize::checked_from_mib(*mib)
            .ok_or_else(|| ConfigurationError::new(field, format!("{} MiB is out of range", mib))),
        Some(MemoryHint::Text(text)) => text
            .parse()
            .map_err(|e: MemoryParseError| ConfigurationError::new(field, e.to_string())),
    }
}
