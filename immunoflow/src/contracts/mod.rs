//! Stage contracts.
//!
//! This module provides:
//! - Stage definitions and collaborator references
//! - Typed configuration schemas
//! - The registry resolving artifact types to their producing stage

mod definition;
mod registry;
mod schema;

pub use definition::{Collaborator, CommandSpec, EndpointSpec, StageDefinition};
pub use registry::StageRegistry;
pub use schema::{ConfigSchema, OptionKind, OptionSpec, ResolvedConfig};
