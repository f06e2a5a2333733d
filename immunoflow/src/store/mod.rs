//! Artifact and checkpoint storage.
//!
//! Both stores are append-only and content-keyed, so duplicate writes for
//! the same key are harmless.

mod artifacts;
mod checkpoints;
mod discover;
mod journal;

pub use artifacts::{
    ArtifactStore, FsArtifactStore, IngestRequest, StagingArea, ARTIFACT_JOURNAL, OBJECTS_DIR,
    PAYLOAD_NAME, STAGING_DIR,
};
pub use checkpoints::{
    CheckpointStore, FsCheckpointStore, InMemoryCheckpointStore, CHECKPOINT_JOURNAL,
};
pub use discover::{discover_raw_runs, sample_from_dir, DiscoveredRun, TDF_MARKER};
