//! Execution engine.
//!
//! Walks an [`ExecutionPlan`](crate::graph::ExecutionPlan), gating every
//! stage on the checkpoint store and running independent branches
//! concurrently under a bounded worker pool.

mod executor;
#[cfg(test)]
mod integration_tests;
mod retry;

pub use executor::PipelineEngine;
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState};

use crate::core::{ArtifactType, SampleId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// What to do with the rest of the plan once a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Keep running every stage that does not depend on the failed one, so
    /// sibling branches finish and are checkpointed.
    #[default]
    ContinueOnFailure,
    /// Stop scheduling new stages; in-flight ones are drained.
    FailFast,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContinueOnFailure => write!(f, "continue_on_failure"),
            Self::FailFast => write!(f, "fail_fast"),
        }
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "continue_on_failure" | "continue" => Ok(Self::ContinueOnFailure),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(format!("unknown failure mode '{other}'")),
        }
    }
}

const fn default_worker_slots() -> usize {
    2
}

/// Engine limits and policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent collaborator invocations across all runs.
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
    /// Extra concurrency caps per stage resource class (e.g. `gpu = 1`).
    #[serde(default)]
    pub resource_limits: BTreeMap<String, usize>,
    /// Failure handling.
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_slots: default_worker_slots(),
            resource_limits: BTreeMap::new(),
            failure_mode: FailureMode::default(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration: two worker slots, no resource
    /// limits, continue on failure.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool size. Zero is treated as one.
    #[must_use]
    pub const fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    /// Caps concurrent invocations of stages in `class`.
    #[must_use]
    pub fn with_resource_limit(mut self, class: impl Into<String>, limit: usize) -> Self {
        self.resource_limits.insert(class.into(), limit);
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub const fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }
}

/// A request to materialize `target` for `sample`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Sample scope.
    pub sample: SampleId,
    /// Artifact type to produce.
    pub target: ArtifactType,
    /// Raw option values per stage id; validated against each schema.
    pub stage_config: BTreeMap<String, Map<String, Value>>,
    /// Command reported for resuming a failed run.
    pub resume_command: Option<String>,
}

impl RunRequest {
    /// Creates a request with no stage configuration.
    #[must_use]
    pub fn new(sample: SampleId, target: ArtifactType) -> Self {
        Self {
            sample,
            target,
            stage_config: BTreeMap::new(),
            resume_command: None,
        }
    }

    /// Replaces the option values of one stage.
    #[must_use]
    pub fn with_stage_config(mut self, stage_id: impl Into<String>, values: Map<String, Value>) -> Self {
        self.stage_config.insert(stage_id.into(), values);
        self
    }

    /// Sets a single option value.
    #[must_use]
    pub fn with_option(
        mut self,
        stage_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.stage_config
            .entry(stage_id.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Sets the resume command reported on failure.
    #[must_use]
    pub fn with_resume_command(mut self, command: impl Into<String>) -> Self {
        self.resume_command = Some(command.into());
        self
    }

    /// The resume command, defaulting to the equivalent `immunoflow run`.
    #[must_use]
    pub fn resume_command(&self) -> String {
        self.resume_command.clone().unwrap_or_else(|| {
            format!(
                "immunoflow run --sample {} --target {}",
                self.sample, self.target
            )
        })
    }
}
