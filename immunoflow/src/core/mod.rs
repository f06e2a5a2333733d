//! Core domain model types for immunoflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Typed, content-addressed artifacts
//! - Stage run records and their state machine
//! - Pipeline run reports

mod artifact;
mod run;
mod stage_run;
mod status;

pub use artifact::{Artifact, ArtifactId, ArtifactType, SampleId, IMPORT_PRODUCER};
pub use run::{PipelineRun, RunFailure};
pub use stage_run::StageRun;
pub use status::{PipelineRunStatus, StageRunStatus};
