//! Error types for immunoflow.
//!
//! Errors fall into three groups:
//!
//! - configuration-time errors (unknown type, ambiguous producer, cycle,
//!   duplicate stage), reported before any collaborator is invoked;
//! - local validation errors (missing input artifact, invalid input), fatal to
//!   the current pipeline run and never retried;
//! - stage execution errors, classified transient or permanent.

use crate::core::{ArtifactId, ArtifactType, SampleId, StageRunStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for immunoflow operations.
#[derive(Debug, Error)]
pub enum ImmunoflowError {
    /// No stage produces the requested type.
    #[error("{0}")]
    UnknownArtifactType(#[from] UnknownArtifactTypeError),

    /// More than one stage produces the requested type.
    #[error("{0}")]
    AmbiguousProducer(#[from] AmbiguousProducerError),

    /// The resolved stage graph contains a cycle.
    #[error("{0}")]
    CyclicDependency(#[from] CyclicDependencyError),

    /// A stage id was registered twice with different contracts.
    #[error("{0}")]
    DuplicateStage(#[from] DuplicateStageError),

    /// A stage input could not be found in the artifact store.
    #[error("{0}")]
    MissingInputArtifact(#[from] MissingInputArtifactError),

    /// Inputs or configuration failed validation.
    #[error("{0}")]
    InvalidInput(#[from] InvalidInputError),

    /// An external collaborator failed.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// A stage run was driven through an illegal state transition.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// Artifact or checkpoint persistence failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The pipeline manifest could not be loaded.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImmunoflowError {
    /// Returns true for errors detected while compiling the stage graph.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownArtifactType(_)
                | Self::AmbiguousProducer(_)
                | Self::CyclicDependency(_)
                | Self::DuplicateStage(_)
        )
    }

    /// Returns the contract diagnostics attached to configuration errors.
    #[must_use]
    pub fn error_info(&self) -> Option<&ContractErrorInfo> {
        match self {
            Self::UnknownArtifactType(e) => Some(&e.error_info),
            Self::AmbiguousProducer(e) => Some(&e.error_info),
            Self::CyclicDependency(e) => Some(&e.error_info),
            Self::DuplicateStage(e) => Some(&e.error_info),
            _ => None,
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when no stage produces a requested artifact type.
#[derive(Debug, Clone, Error)]
#[error("No stage produces artifact type '{artifact_type}'")]
pub struct UnknownArtifactTypeError {
    /// The unresolvable type.
    pub artifact_type: ArtifactType,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl UnknownArtifactTypeError {
    /// Creates a new unknown artifact type error.
    #[must_use]
    pub fn new(artifact_type: ArtifactType) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-UNKNOWN-TYPE",
            format!("Artifact type '{artifact_type}' has no registered producer"),
        )
        .with_fix_hint("Register a stage producing this type or declare it as a source.");
        Self {
            artifact_type,
            error_info: info,
        }
    }
}

/// Error raised when several stages claim the same output type.
#[derive(Debug, Clone, Error)]
#[error("Artifact type '{artifact_type}' has multiple producers: {}", producers.join(", "))]
pub struct AmbiguousProducerError {
    /// The contested type.
    pub artifact_type: ArtifactType,
    /// Stage ids claiming the type, in declaration order.
    pub producers: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl AmbiguousProducerError {
    /// Creates a new ambiguous producer error.
    #[must_use]
    pub fn new(artifact_type: ArtifactType, producers: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-AMBIGUOUS-PRODUCER",
            format!("Only one stage may produce '{artifact_type}'"),
        )
        .with_fix_hint(
            "Keep a single producer, or add an explicit merge stage consuming each engine's output.",
        );
        Self {
            artifact_type,
            producers,
            error_info: info,
        }
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cyclic dependency between stages: {}", cycle_path.join(" -> "))]
pub struct CyclicDependencyError {
    /// The path of stages forming the cycle; first and last entries match.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CyclicDependencyError {
    /// Creates a new cyclic dependency error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-CYCLE",
            format!("Stage graph contains a cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the input types in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a stage id is re-registered with another contract.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage_id}' is already registered with a different contract")]
pub struct DuplicateStageError {
    /// The conflicting stage id.
    pub stage_id: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl DuplicateStageError {
    /// Creates a new duplicate stage error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        let stage_id = stage_id.into();
        let info = ContractErrorInfo::new(
            "CONTRACT-DUPLICATE-STAGE",
            format!("Stage '{stage_id}' has two different definitions"),
        )
        .with_fix_hint("Rename one of the stages or make the definitions identical.");
        Self {
            stage_id,
            error_info: info,
        }
    }
}

/// Error raised when a stage input is not present in the artifact store.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage_id}' is missing input '{artifact_type}' for sample '{sample}'")]
pub struct MissingInputArtifactError {
    /// The stage needing the input.
    pub stage_id: String,
    /// The sample scope.
    pub sample: SampleId,
    /// The missing type.
    pub artifact_type: ArtifactType,
}

impl MissingInputArtifactError {
    /// Creates a new missing input error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, sample: SampleId, artifact_type: ArtifactType) -> Self {
        Self {
            stage_id: stage_id.into(),
            sample,
            artifact_type,
        }
    }
}

/// Error raised when inputs or configuration fail validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid input for '{stage_id}': {reason}")]
pub struct InvalidInputError {
    /// The stage (or `sample`/`manifest` scope) that rejected the input.
    pub stage_id: String,
    /// What was wrong.
    pub reason: String,
}

impl InvalidInputError {
    /// Creates a new invalid input error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            reason: reason.into(),
        }
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, transient I/O, rate limiting.
    Transient,
    /// Everything else.
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Captured diagnostics of a failed invocation, kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Human readable summary.
    pub message: String,
    /// Exit code if the collaborator was a process that exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Tail of captured stdout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Tail of captured stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl Diagnostic {
    /// Creates a diagnostic with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub const fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Sets captured output.
    #[must_use]
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        if !self.stderr.is_empty() {
            write!(f, "\n--- stderr ---\n{}", self.stderr)?;
        }
        Ok(())
    }
}

/// Error raised when an external collaborator fails.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage_id}' failed after {attempts} attempt(s) ({class}): {diagnostic}")]
pub struct StageExecutionError {
    /// The failing stage.
    pub stage_id: String,
    /// Transient or permanent.
    pub class: FailureClass,
    /// Captured diagnostic of the last attempt.
    pub diagnostic: Diagnostic,
    /// Number of attempts made.
    pub attempts: u32,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(
        stage_id: impl Into<String>,
        class: FailureClass,
        diagnostic: Diagnostic,
        attempts: u32,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            class,
            diagnostic,
            attempts,
        }
    }

    /// Returns true if the failure was classified transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

/// Error raised on an illegal stage run state transition.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage_id}' cannot move from {from} to {to}")]
pub struct InvalidTransitionError {
    /// The stage whose run was being updated.
    pub stage_id: String,
    /// Current status.
    pub from: StageRunStatus,
    /// Requested status.
    pub to: StageRunStatus,
}

/// Errors raised by the artifact and checkpoint stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("Store I/O error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A journal record could not be encoded.
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The artifact id is not in the index.
    #[error("Unknown artifact: {0}")]
    UnknownArtifact(ArtifactId),

    /// A payload to ingest does not exist or is empty.
    #[error("Payload at {} is missing or empty", path.display())]
    EmptyPayload {
        /// The rejected payload path.
        path: PathBuf,
    },

    /// Two acquisitions map to the same sample id.
    #[error("Acquisitions {} and {} both map to sample '{sample}'", first.display(), second.display())]
    DuplicateSample {
        /// The contested sample id.
        sample: SampleId,
        /// The acquisition that claimed the id first.
        first: PathBuf,
        /// The acquisition that collided with it.
        second: PathBuf,
    },
}

impl StoreError {
    /// Wraps an I/O error with the path it concerns.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while loading a pipeline manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("Cannot read manifest {}: {source}", path.display())]
    Read {
        /// Manifest path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON for the expected schema.
    #[error("Cannot parse manifest {}: {source}", path.display())]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The manifest parsed but is inconsistent.
    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_cyclic_dependency_error() {
        let err = CyclicDependencyError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info.code, "CONTRACT-CYCLE");
    }

    #[test]
    fn test_configuration_errors_are_classified() {
        let err: ImmunoflowError = UnknownArtifactTypeError::new(ArtifactType::OrfCalls).into();
        assert!(err.is_configuration_error());
        assert_eq!(err.error_info().unwrap().code, "CONTRACT-UNKNOWN-TYPE");

        let err: ImmunoflowError = InvalidInputError::new("binding", "missing haplotype").into();
        assert!(!err.is_configuration_error());
        assert!(err.error_info().is_none());
    }

    #[test]
    fn test_ambiguous_producer_message_lists_stages() {
        let err = AmbiguousProducerError::new(
            ArtifactType::SearchResults,
            vec!["fragpipe".to_string(), "peaks".to_string()],
        );
        assert!(err.to_string().contains("fragpipe, peaks"));
    }

    #[test]
    fn test_stage_execution_error_display() {
        let diag = Diagnostic::new("tool exited unsuccessfully")
            .with_exit_code(Some(2))
            .with_output("", "HLA allele not supported");
        let err = StageExecutionError::new("binding", FailureClass::Permanent, diag, 1);

        let text = err.to_string();
        assert!(text.contains("'binding'"));
        assert!(text.contains("permanent"));
        assert!(text.contains("exit code 2"));
        assert!(text.contains("HLA allele not supported"));
        assert!(!err.is_transient());
    }
}
