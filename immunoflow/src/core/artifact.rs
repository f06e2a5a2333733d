//! Typed, content-addressed artifacts.

use crate::errors::InvalidInputError;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Semantic type of a pipeline artifact.
///
/// Every stage consumes a fixed list of these and produces exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// A raw instrument acquisition (e.g. a Bruker `.d` directory).
    RawRun,
    /// A raw run that passed QC and cleanup.
    CleanedRun,
    /// Converted spectra (mzML).
    ConvertedSpectra,
    /// Search engine identifications.
    SearchResults,
    /// Rescored peptide-spectrum matches.
    RescoredPsms,
    /// Collisional cross-section predictions.
    CcsPredictions,
    /// Retention time predictions.
    RtPredictions,
    /// MHC binding affinity predictions.
    BindingAffinities,
    /// ORF / codon-usage calls.
    OrfCalls,
    /// Epitope database similarity scores.
    SimilarityScores,
    /// Final ranked immunopeptide list.
    RankedList,
}

impl ArtifactType {
    /// All artifact types, upstream first.
    pub const ALL: [Self; 11] = [
        Self::RawRun,
        Self::CleanedRun,
        Self::ConvertedSpectra,
        Self::SearchResults,
        Self::RescoredPsms,
        Self::CcsPredictions,
        Self::RtPredictions,
        Self::BindingAffinities,
        Self::OrfCalls,
        Self::SimilarityScores,
        Self::RankedList,
    ];

    /// Returns the stable snake_case name used on disk and in manifests.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RawRun => "raw_run",
            Self::CleanedRun => "cleaned_run",
            Self::ConvertedSpectra => "converted_spectra",
            Self::SearchResults => "search_results",
            Self::RescoredPsms => "rescored_psms",
            Self::CcsPredictions => "ccs_predictions",
            Self::RtPredictions => "rt_predictions",
            Self::BindingAffinities => "binding_affinities",
            Self::OrfCalls => "orf_calls",
            Self::SimilarityScores => "similarity_scores",
            Self::RankedList => "ranked_list",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown artifact type '{s}'"))
    }
}

/// Content-derived identifier of an artifact (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Wraps an already computed identifier.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first 12 characters, for logs and reports.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the sample/patient scope an artifact belongs to.
///
/// Sample ids become directory names in the store, so only ASCII
/// alphanumerics, `-`, `_` and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SampleId(String);

impl SampleId {
    /// Parses and validates a sample id.
    ///
    /// # Errors
    ///
    /// Returns an error for empty ids, path-like ids, or disallowed characters.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidInputError> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if id.is_empty() || id == "." || id == ".." || !valid_chars {
            return Err(InvalidInputError::new(
                "sample",
                format!("invalid sample id '{id}': use letters, digits, '-', '_' or '.'"),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the sample id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SampleId {
    type Err = InvalidInputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SampleId {
    type Error = InvalidInputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SampleId> for String {
    fn from(value: SampleId) -> Self {
        value.0
    }
}

/// Producer id recorded for artifacts that entered the store by import.
pub const IMPORT_PRODUCER: &str = "import";

/// An immutable unit of pipeline data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Identifier derived from content hash, producer and inputs.
    pub id: ArtifactId,
    /// Semantic type.
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Owning sample.
    pub sample: SampleId,
    /// Hash of the payload bytes (file or directory tree).
    pub content_hash: String,
    /// Where the payload lives.
    pub location: PathBuf,
    /// Stage that produced the artifact, or `import`.
    pub produced_by: String,
    /// Artifacts the producing stage consumed, in declaration order.
    #[serde(default)]
    pub inputs: Vec<ArtifactId>,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// When the artifact was registered.
    pub created_at: Timestamp,
}

impl Artifact {
    /// Returns true if the artifact entered the store by import.
    #[must_use]
    pub fn is_imported(&self) -> bool {
        self.produced_by == IMPORT_PRODUCER
    }
}
