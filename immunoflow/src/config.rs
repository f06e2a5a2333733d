//! Pipeline manifest.
//!
//! A manifest is a JSON document describing where the store lives, engine
//! limits, extra stages and per-stage option values:
//!
//! ```json
//! {
//!   "store_root": "store",
//!   "worker_slots": 4,
//!   "resource_limits": { "gpu": 1 },
//!   "failure_mode": "continue_on_failure",
//!   "stage_config": { "search": { "database": "proteome_fusions.fasta" } },
//!   "samples": { "S1": { "binding": { "haplotype": "HLA-A*02:01" } } }
//! }
//! ```
//!
//! Relative `store_root` paths are resolved against the manifest's
//! directory.

use crate::catalog::catalog_stages;
use crate::contracts::{StageDefinition, StageRegistry};
use crate::core::{ArtifactType, SampleId};
use crate::engine::{EngineConfig, RunRequest};
use crate::errors::{ImmunoflowError, ManifestError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Per-stage option values, keyed by stage id.
pub type StageConfigMap = BTreeMap<String, Map<String, Value>>;

fn default_store_root() -> PathBuf {
    PathBuf::from(".immunoflow")
}

const fn default_use_catalog() -> bool {
    true
}

/// A parsed pipeline manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineManifest {
    /// Artifact and checkpoint store root.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    /// Start from the built-in catalog.
    #[serde(default = "default_use_catalog")]
    pub use_catalog: bool,
    /// Worker slots, resource limits and failure mode.
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Source types besides `raw_run`.
    #[serde(default)]
    pub sources: Vec<ArtifactType>,
    /// Stage definitions; an id already in the catalog replaces it.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    /// Option values applied to every sample.
    #[serde(default)]
    pub stage_config: StageConfigMap,
    /// Option values for one sample, layered over `stage_config`.
    #[serde(default)]
    pub samples: BTreeMap<String, StageConfigMap>,
}

impl Default for PipelineManifest {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            use_catalog: default_use_catalog(),
            engine: EngineConfig::default(),
            sources: Vec::new(),
            stages: Vec::new(),
            stage_config: StageConfigMap::new(),
            samples: BTreeMap::new(),
        }
    }
}

impl PipelineManifest {
    /// Reads and validates a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: Self = serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if manifest.store_root.is_relative() {
            if let Some(dir) = path.parent() {
                manifest.store_root = dir.join(&manifest.store_root);
            }
        }
        manifest.validate()?;
        tracing::debug!(
            manifest = %path.display(),
            store_root = %manifest.store_root.display(),
            stages = manifest.stages.len(),
            "Loaded pipeline manifest"
        );
        Ok(manifest)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invalid`] for zero limits, repeated stage
    /// ids, or malformed sample ids.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.engine.worker_slots == 0 {
            return Err(ManifestError::Invalid("worker_slots must be at least 1".into()));
        }
        if let Some((class, _)) = self.engine.resource_limits.iter().find(|(_, &limit)| limit == 0) {
            return Err(ManifestError::Invalid(format!(
                "resource limit for '{class}' must be at least 1"
            )));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(ManifestError::Invalid(format!(
                    "stage '{}' is defined twice",
                    stage.id
                )));
            }
        }
        for sample in self.samples.keys() {
            SampleId::new(sample.as_str()).map_err(|e| ManifestError::Invalid(e.reason))?;
        }
        Ok(())
    }

    /// Stage definitions in declaration order: the catalog (if enabled)
    /// with manifest overrides in place, then manifest-only stages.
    #[must_use]
    pub fn stage_definitions(&self) -> Vec<StageDefinition> {
        let mut overrides: BTreeMap<&str, &StageDefinition> =
            self.stages.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut definitions = Vec::new();
        if self.use_catalog {
            for stage in catalog_stages() {
                match overrides.remove(stage.id.as_str()) {
                    Some(replacement) => definitions.push(replacement.clone()),
                    None => definitions.push(stage),
                }
            }
        }
        definitions.extend(
            self.stages
                .iter()
                .filter(|s| overrides.contains_key(s.id.as_str()))
                .cloned(),
        );
        definitions
    }

    /// Builds the stage registry the manifest describes.
    ///
    /// # Errors
    ///
    /// Returns registration errors (invalid definitions, a stage producing a
    /// source type).
    pub fn build_registry(&self) -> Result<StageRegistry, ImmunoflowError> {
        let registry = StageRegistry::with_sources(
            std::iter::once(ArtifactType::RawRun).chain(self.sources.iter().copied()),
        );
        for stage in self.stage_definitions() {
            registry.register(stage)?;
        }
        Ok(registry)
    }

    /// Option values for `sample`: the shared values with the sample's own
    /// layered on top, key by key.
    #[must_use]
    pub fn stage_config_for(&self, sample: &SampleId) -> StageConfigMap {
        let mut merged = self.stage_config.clone();
        if let Some(own) = self.samples.get(sample.as_str()) {
            for (stage_id, values) in own {
                let entry = merged.entry(stage_id.clone()).or_default();
                for (key, value) in values {
                    entry.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    /// A run request for `sample` and `target` carrying the manifest's
    /// option values.
    #[must_use]
    pub fn run_request(&self, sample: SampleId, target: ArtifactType) -> RunRequest {
        let stage_config = self.stage_config_for(&sample);
        let mut request = RunRequest::new(sample, target);
        request.stage_config = stage_config;
        request
    }
}
