//! Uniform stage invocation.
//!
//! The engine hands every collaborator the same [`InvocationRequest`]:
//! ordered input payloads, the resolved configuration, the sample, and a
//! fresh staging output location. A collaborator succeeds by writing exactly
//! one payload there.

mod command;
#[cfg(feature = "endpoints")]
mod endpoint;
pub mod search_manifest;
mod template;

pub use command::CommandInvoker;
#[cfg(feature = "endpoints")]
pub use endpoint::EndpointInvoker;
pub use template::{CommandTemplate, RenderedCommand};

use crate::cancellation::CancellationToken;
use crate::contracts::{Collaborator, ResolvedConfig, StageDefinition};
use crate::core::{ArtifactId, ArtifactType, SampleId};
use crate::errors::{Diagnostic, FailureClass};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Characters of stdout/stderr kept in diagnostics.
pub const DIAGNOSTIC_TAIL_CHARS: usize = 4000;

/// One input payload handed to a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationInput {
    /// Declared input type.
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Artifact id.
    pub id: ArtifactId,
    /// Payload location.
    pub path: PathBuf,
}

/// Everything a collaborator needs for one attempt.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// The stage contract.
    pub stage: Arc<StageDefinition>,
    /// Sample scope.
    pub sample: SampleId,
    /// Inputs in declaration order.
    pub inputs: Vec<InvocationInput>,
    /// Validated configuration with defaults applied.
    pub config: ResolvedConfig,
    /// Where the single output payload must be written.
    pub output_path: PathBuf,
    /// Scratch directory, discarded with the staging area.
    pub work_dir: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What a successful invocation reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Exit code, for process collaborators.
    pub exit_code: Option<i32>,
    /// Tail of stdout.
    pub stdout: String,
    /// Tail of stderr.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Why an invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// The collaborator failed.
    #[error("{class} failure: {diagnostic}")]
    Failed {
        /// Whether a retry may help.
        class: FailureClass,
        /// Captured diagnostic.
        diagnostic: Diagnostic,
    },

    /// The run was cancelled while the collaborator was running.
    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    /// A failure worth retrying.
    #[must_use]
    pub const fn transient(diagnostic: Diagnostic) -> Self {
        Self::Failed {
            class: FailureClass::Transient,
            diagnostic,
        }
    }

    /// A failure no retry will fix.
    #[must_use]
    pub const fn permanent(diagnostic: Diagnostic) -> Self {
        Self::Failed {
            class: FailureClass::Permanent,
            diagnostic,
        }
    }
}

/// Performs the work of a stage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Runs one attempt. Implementations must stop promptly once `cancel`
    /// fires and return [`InvocationError::Cancelled`].
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvocationError>;
}

/// Dispatches to the collaborator named by each stage definition.
#[derive(Debug, Clone, Default)]
pub struct CollaboratorInvoker {
    command: CommandInvoker,
    #[cfg(feature = "endpoints")]
    endpoint: EndpointInvoker,
}

impl CollaboratorInvoker {
    /// Creates an invoker for commands and (with the `endpoints` feature)
    /// model endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StageInvoker for CollaboratorInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvocationError> {
        match &request.stage.collaborator {
            Collaborator::Command(spec) => self.command.run(spec, request, cancel).await,
            #[cfg(feature = "endpoints")]
            Collaborator::Endpoint(spec) => self.endpoint.run(spec, request, cancel).await,
            #[cfg(not(feature = "endpoints"))]
            Collaborator::Endpoint(spec) => Err(InvocationError::permanent(Diagnostic::new(
                format!(
                    "stage '{}' calls endpoint {} but this build lacks the `endpoints` feature",
                    request.stage.id, spec.url
                ),
            ))),
        }
    }
}
