//! Registry of stage contracts.

use super::StageDefinition;
use crate::core::ArtifactType;
use crate::errors::{
    AmbiguousProducerError, DuplicateStageError, ImmunoflowError, InvalidInputError,
    UnknownArtifactTypeError,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<String, Arc<StageDefinition>>,
    order: Vec<String>,
    sources: BTreeSet<ArtifactType>,
}

/// In-memory registry of stage definitions.
///
/// Stages keep their declaration order, which the graph builder uses to
/// break ties. Types that enter the pipeline by import are declared as
/// sources; `RawRun` is a source by default.
#[derive(Debug)]
pub struct StageRegistry {
    entries: RwLock<Entries>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    /// Creates a registry whose only source type is `RawRun`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sources([ArtifactType::RawRun])
    }

    /// Creates a registry with an explicit set of source types.
    #[must_use]
    pub fn with_sources(sources: impl IntoIterator<Item = ArtifactType>) -> Self {
        let entries = Entries {
            sources: sources.into_iter().collect(),
            ..Entries::default()
        };
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Registers a stage.
    ///
    /// Registering an identical definition twice is a no-op and returns the
    /// existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateStageError`] if the id is taken by a different
    /// definition, or [`InvalidInputError`] if the definition is malformed or
    /// produces a declared source type.
    pub fn register(
        &self,
        definition: StageDefinition,
    ) -> Result<Arc<StageDefinition>, ImmunoflowError> {
        definition.validate()?;

        let mut entries = self.entries.write();
        if let Some(existing) = entries.by_id.get(&definition.id) {
            if **existing == definition {
                return Ok(Arc::clone(existing));
            }
            return Err(DuplicateStageError::new(&definition.id).into());
        }
        if entries.sources.contains(&definition.output) {
            return Err(InvalidInputError::new(
                &definition.id,
                format!(
                    "'{}' is an imported source type and cannot be produced by a stage",
                    definition.output
                ),
            )
            .into());
        }

        tracing::debug!(
            stage = %definition.id,
            output = %definition.output,
            collaborator = definition.collaborator.label(),
            "Registered stage"
        );
        let id = definition.id.clone();
        let definition = Arc::new(definition);
        entries.order.push(id.clone());
        entries.by_id.insert(id, Arc::clone(&definition));
        Ok(definition)
    }

    /// Declares a type that enters the pipeline by import.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidInputError`] if a registered stage already produces it.
    pub fn declare_source(&self, artifact_type: ArtifactType) -> Result<(), InvalidInputError> {
        let mut entries = self.entries.write();
        if let Some(producer) = entries.by_id.values().find(|d| d.output == artifact_type) {
            return Err(InvalidInputError::new(
                &producer.id,
                format!("cannot declare '{artifact_type}' as a source: this stage produces it"),
            ));
        }
        entries.sources.insert(artifact_type);
        Ok(())
    }

    /// Returns true if `artifact_type` is a declared source.
    #[must_use]
    pub fn is_source(&self, artifact_type: ArtifactType) -> bool {
        self.entries.read().sources.contains(&artifact_type)
    }

    /// Declared source types.
    #[must_use]
    pub fn sources(&self) -> Vec<ArtifactType> {
        self.entries.read().sources.iter().copied().collect()
    }

    /// Returns the single stage producing `artifact_type`.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownArtifactTypeError`] when nothing produces the type and
    /// [`AmbiguousProducerError`] when more than one stage does.
    pub fn resolve(
        &self,
        artifact_type: ArtifactType,
    ) -> Result<Arc<StageDefinition>, ImmunoflowError> {
        let mut producers = self.producers(artifact_type);
        match producers.len() {
            0 => Err(UnknownArtifactTypeError::new(artifact_type).into()),
            1 => Ok(producers.remove(0)),
            _ => Err(AmbiguousProducerError::new(
                artifact_type,
                producers.iter().map(|d| d.id.clone()).collect(),
            )
            .into()),
        }
    }

    /// Every stage producing `artifact_type`, in declaration order.
    #[must_use]
    pub fn producers(&self, artifact_type: ArtifactType) -> Vec<Arc<StageDefinition>> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id))
            .filter(|d| d.output == artifact_type)
            .cloned()
            .collect()
    }

    /// Fetches a stage by id.
    #[must_use]
    pub fn get(&self, stage_id: &str) -> Option<Arc<StageDefinition>> {
        self.entries.read().by_id.get(stage_id).cloned()
    }

    /// All stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> Vec<Arc<StageDefinition>> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id))
            .cloned()
            .collect()
    }

    /// Position of `stage_id` in declaration order.
    #[must_use]
    pub fn declaration_index(&self, stage_id: &str) -> Option<usize> {
        self.entries.read().order.iter().position(|id| id == stage_id)
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().order.len()
    }

    /// Returns true if no stage is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().order.is_empty()
    }
}
