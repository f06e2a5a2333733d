//! Testing utilities for immunoflow pipelines.
//!
//! This module provides:
//! - A scripted invoker that stands in for external tools
//! - Temporary stores and catalog engines

mod fixtures;
mod mocks;

pub use fixtures::{catalog_request, fast_catalog_registry, TestWorkspace};
pub use mocks::{Script, ScriptedInvoker};
