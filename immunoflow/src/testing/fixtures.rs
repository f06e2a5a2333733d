//! Store and engine fixtures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::catalog::catalog_stages;
use crate::contracts::StageRegistry;
use crate::core::{Artifact, ArtifactType, SampleId};
use crate::engine::{EngineConfig, JitterStrategy, PipelineEngine, RunRequest};
use crate::errors::{ImmunoflowError, StoreError};
use crate::events::CollectingEventSink;
use crate::invoke::StageInvoker;
use crate::store::{ArtifactStore, FsArtifactStore, FsCheckpointStore};

/// The catalog with retry delays shortened to a few milliseconds. Attempt
/// limits are unchanged.
///
/// # Errors
///
/// Only fails if the catalog itself is inconsistent.
pub fn fast_catalog_registry() -> Result<StageRegistry, ImmunoflowError> {
    let registry = StageRegistry::new();
    for mut stage in catalog_stages() {
        stage.retry = stage
            .retry
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
            .with_jitter(JitterStrategy::None);
        registry.register(stage)?;
    }
    Ok(registry)
}

/// A request carrying every option the catalog requires.
#[must_use]
pub fn catalog_request(sample: &SampleId, target: ArtifactType) -> RunRequest {
    RunRequest::new(sample.clone(), target)
        .with_option("search", "database", "proteome_fusions.fasta")
        .with_option("binding", "haplotype", "HLA-A*02:01,HLA-B*07:02")
        .with_option("similarity", "epitope_db", "iedb_2024.csv")
}

/// Filesystem stores in a temporary directory.
///
/// The directory is removed when the workspace is dropped.
#[derive(Debug)]
pub struct TestWorkspace {
    dir: TempDir,
    /// Artifact store rooted at `<dir>/store`.
    pub artifacts: Arc<FsArtifactStore>,
    /// Checkpoint store rooted at `<dir>/store`.
    pub checkpoints: Arc<FsCheckpointStore>,
}

impl TestWorkspace {
    /// Opens fresh stores.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the temporary directory or stores cannot be
    /// created.
    pub async fn new() -> Result<Self, StoreError> {
        let dir = tempfile::tempdir().map_err(|e| StoreError::io(std::env::temp_dir(), e))?;
        let store_root = dir.path().join("store");
        let artifacts = Arc::new(FsArtifactStore::open(&store_root).await?);
        let checkpoints = Arc::new(FsCheckpointStore::open(&store_root).await?);
        Ok(Self {
            dir,
            artifacts,
            checkpoints,
        })
    }

    /// The temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The store root.
    #[must_use]
    pub fn store_root(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    /// Reopens both stores from disk, as a new process would.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a journal cannot be replayed.
    pub async fn reopen(&mut self) -> Result<(), StoreError> {
        let root = self.store_root();
        self.artifacts = Arc::new(FsArtifactStore::open(&root).await?);
        self.checkpoints = Arc::new(FsCheckpointStore::open(&root).await?);
        Ok(())
    }

    /// Writes a fake Bruker `.d` acquisition for `sample` and imports it as
    /// a raw run. `frames` distinguishes acquisitions of the same sample.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the files cannot be written or imported.
    pub async fn import_raw_run(&self, sample: &SampleId, frames: &str) -> Result<Artifact, StoreError> {
        let run = self.dir.path().join("raw").join(format!("{sample}.d"));
        tokio::fs::create_dir_all(&run)
            .await
            .map_err(|e| StoreError::io(&run, e))?;
        let tdf = run.join("analysis.tdf");
        tokio::fs::write(&tdf, format!("tdf:{sample}"))
            .await
            .map_err(|e| StoreError::io(&tdf, e))?;
        let bin = run.join("analysis.tdf_bin");
        tokio::fs::write(&bin, frames)
            .await
            .map_err(|e| StoreError::io(&bin, e))?;
        self.artifacts.import(&run, sample, ArtifactType::RawRun).await
    }

    /// An engine over the fast catalog, these stores and `invoker`, with a
    /// collecting event sink.
    ///
    /// # Errors
    ///
    /// Only fails if the catalog itself is inconsistent.
    pub fn engine(
        &self,
        invoker: Arc<dyn StageInvoker>,
        config: EngineConfig,
    ) -> Result<(PipelineEngine, Arc<CollectingEventSink>), ImmunoflowError> {
        let events = Arc::new(CollectingEventSink::new());
        let engine = PipelineEngine::new(
            Arc::new(fast_catalog_registry()?),
            self.artifacts.clone(),
            self.checkpoints.clone(),
            invoker,
            config,
        )
        .with_events(events.clone());
        Ok((engine, events))
    }
}
