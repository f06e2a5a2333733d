//! Checkpoint storage for settled stage runs.
//!
//! A checkpoint is a succeeded [`StageRun`] keyed by
//! `(stage id, sorted input ids, config hash)`. The engine asks
//! [`CheckpointStore::is_cached`] before invoking a collaborator.

use super::journal::{self, Journal};
use crate::core::{ArtifactId, SampleId, StageRun, StageRunStatus};
use crate::errors::StoreError;
use crate::hashing;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

/// Checkpoint journal file name.
pub const CHECKPOINT_JOURNAL: &str = "checkpoints.jsonl";

/// Persistence of stage run outcomes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Output of an earlier successful run with the same key, if any.
    async fn is_cached(
        &self,
        stage_id: &str,
        input_ids: &[ArtifactId],
        config_hash: &str,
    ) -> Option<ArtifactId>;

    /// Persists a settled stage run.
    async fn record(&self, run: &StageRun) -> Result<(), StoreError>;

    /// Every recorded run of `stage_id`, oldest first.
    async fn history(&self, stage_id: &str) -> Vec<StageRun>;

    /// Every recorded run for `sample`, oldest first.
    async fn runs_for_sample(&self, sample: &SampleId) -> Vec<StageRun>;
}

#[derive(Debug, Default)]
struct CheckpointIndex {
    runs: Vec<StageRun>,
    succeeded: HashMap<String, ArtifactId>,
}

impl CheckpointIndex {
    fn insert(&mut self, run: StageRun) {
        if run.status == StageRunStatus::Succeeded {
            if let Some(output) = &run.output {
                self.succeeded.insert(run.cache_key.clone(), output.clone());
            }
        }
        self.runs.push(run);
    }

    fn lookup(&self, stage_id: &str, input_ids: &[ArtifactId], config_hash: &str) -> Option<ArtifactId> {
        let key = hashing::cache_key(stage_id, input_ids, config_hash);
        self.succeeded.get(&key).cloned()
    }

    fn filtered(&self, keep: impl Fn(&StageRun) -> bool) -> Vec<StageRun> {
        self.runs.iter().filter(|r| keep(r)).cloned().collect()
    }
}

fn is_settled(run: &StageRun) -> bool {
    matches!(run.status, StageRunStatus::Succeeded | StageRunStatus::Failed)
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    index: RwLock<CheckpointIndex>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().runs.len()
    }

    /// True if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().runs.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn is_cached(
        &self,
        stage_id: &str,
        input_ids: &[ArtifactId],
        config_hash: &str,
    ) -> Option<ArtifactId> {
        self.index.read().lookup(stage_id, input_ids, config_hash)
    }

    async fn record(&self, run: &StageRun) -> Result<(), StoreError> {
        if is_settled(run) {
            self.index.write().insert(run.clone());
        }
        Ok(())
    }

    async fn history(&self, stage_id: &str) -> Vec<StageRun> {
        self.index.read().filtered(|r| r.stage_id == stage_id)
    }

    async fn runs_for_sample(&self, sample: &SampleId) -> Vec<StageRun> {
        self.index.read().filtered(|r| r.sample == *sample)
    }
}

/// Durable checkpoint store backed by an append-only JSON-lines journal.
///
/// The journal is replayed on open; a torn trailing line left by a crash
/// is skipped.
#[derive(Debug)]
pub struct FsCheckpointStore {
    index: RwLock<CheckpointIndex>,
    journal: Journal,
}

impl FsCheckpointStore {
    /// Opens (or creates) `checkpoints.jsonl` under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or opened.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| StoreError::io(root, e))?;
        let path = root.join(CHECKPOINT_JOURNAL);

        let mut index = CheckpointIndex::default();
        for run in journal::replay::<StageRun>(&path).await? {
            index.insert(run);
        }
        tracing::debug!(
            journal = %path.display(),
            runs = index.runs.len(),
            checkpoints = index.succeeded.len(),
            "Replayed checkpoint journal"
        );

        Ok(Self {
            index: RwLock::new(index),
            journal: Journal::open(path).await?,
        })
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn is_cached(
        &self,
        stage_id: &str,
        input_ids: &[ArtifactId],
        config_hash: &str,
    ) -> Option<ArtifactId> {
        self.index.read().lookup(stage_id, input_ids, config_hash)
    }

    async fn record(&self, run: &StageRun) -> Result<(), StoreError> {
        if !is_settled(run) {
            return Ok(());
        }
        self.journal.append(run).await?;
        self.index.write().insert(run.clone());
        Ok(())
    }

    async fn history(&self, stage_id: &str) -> Vec<StageRun> {
        self.index.read().filtered(|r| r.stage_id == stage_id)
    }

    async fn runs_for_sample(&self, sample: &SampleId) -> Vec<StageRun> {
        self.index.read().filtered(|r| r.sample == *sample)
    }
}
