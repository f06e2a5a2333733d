//! # Immunoflow
//!
//! Checkpointed orchestration for immunopeptidomics mass-spectrometry
//! pipelines.
//!
//! Immunoflow takes raw instrument acquisitions through a graph of external
//! tools (QC, conversion, search, rescoring, property predictors, ranking)
//! with support for:
//!
//! - **Typed stage contracts**: every stage consumes and produces declared
//!   artifact types, and plans are derived from those declarations
//! - **Content-addressed artifacts**: outputs are immutable and identified by
//!   content and provenance
//! - **Checkpoint and resume**: a stage whose inputs and configuration are
//!   unchanged is never run twice
//! - **Bounded concurrency**: independent branches run in parallel under a
//!   worker pool and per-resource caps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use immunoflow::prelude::*;
//!
//! let registry = Arc::new(immunopeptidomics_registry()?);
//! let artifacts = Arc::new(FsArtifactStore::open("store").await?);
//! let checkpoints = Arc::new(FsCheckpointStore::open("store").await?);
//! artifacts.import(Path::new("S1.d"), &sample, ArtifactType::RawRun).await?;
//!
//! let engine = PipelineEngine::new(
//!     registry,
//!     artifacts,
//!     checkpoints,
//!     Arc::new(CollaboratorInvoker::new()),
//!     EngineConfig::default(),
//! );
//! let run = engine
//!     .run(RunRequest::new(sample, ArtifactType::RankedList), &CancellationToken::new())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod catalog;
pub mod config;
pub mod contracts;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod hashing;
pub mod invoke;
pub mod observability;
pub mod store;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::catalog::immunopeptidomics_registry;
    pub use crate::config::PipelineManifest;
    pub use crate::contracts::{
        Collaborator, CommandSpec, ConfigSchema, EndpointSpec, OptionKind, OptionSpec,
        StageDefinition, StageRegistry,
    };
    pub use crate::core::{
        Artifact, ArtifactId, ArtifactType, PipelineRun, PipelineRunStatus, SampleId, StageRun,
        StageRunStatus,
    };
    pub use crate::engine::{EngineConfig, FailureMode, PipelineEngine, RetryConfig, RunRequest};
    pub use crate::errors::{
        ContractErrorInfo, CyclicDependencyError, FailureClass, ImmunoflowError,
        MissingInputArtifactError, StageExecutionError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{DependencyGraph, ExecutionPlan};
    pub use crate::invoke::{CollaboratorInvoker, StageInvoker};
    pub use crate::store::{ArtifactStore, CheckpointStore, FsArtifactStore, FsCheckpointStore};
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
