//! Content-addressed artifact storage.

use super::journal::{self, Journal};
use crate::core::{Artifact, ArtifactId, ArtifactType, SampleId, IMPORT_PRODUCER};
use crate::errors::StoreError;
use crate::hashing;
use crate::utils::{generate_uuid, now_utc};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Artifact index journal file name.
pub const ARTIFACT_JOURNAL: &str = "artifacts.jsonl";
/// Directory holding payloads.
pub const OBJECTS_DIR: &str = "objects";
/// Directory holding in-flight outputs.
pub const STAGING_DIR: &str = "staging";
/// File name of a payload inside its object directory.
pub const PAYLOAD_NAME: &str = "payload";

/// A private scratch directory for one invocation attempt.
///
/// Nothing under a staging area is visible through the store until it is
/// ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Root of the staging area.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Where the collaborator must write its single payload.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_NAME)
    }

    /// Scratch directory for collaborator temporaries.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.dir.join("work")
    }
}

/// A payload to register, with its provenance.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// File or directory to take ownership of.
    pub payload: PathBuf,
    /// Owning sample.
    pub sample: SampleId,
    /// Semantic type.
    pub artifact_type: ArtifactType,
    /// Producing stage id, or `import`.
    pub produced_by: String,
    /// Consumed artifacts in declaration order.
    pub inputs: Vec<ArtifactId>,
}

/// Storage for typed, immutable artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Creates a fresh staging area.
    async fn create_staging(&self) -> Result<StagingArea, StoreError>;

    /// Deletes a staging area and anything left in it.
    async fn discard_staging(&self, staging: &StagingArea) -> Result<(), StoreError>;

    /// Moves a payload into the store and registers it.
    ///
    /// Ingesting a payload whose artifact id is already known returns the
    /// existing artifact; the payload is left where it was.
    async fn ingest(&self, request: IngestRequest) -> Result<Artifact, StoreError>;

    /// Looks up an artifact.
    async fn get(&self, id: &ArtifactId) -> Option<Artifact>;

    /// True if the artifact is registered and its payload is on disk.
    async fn contains(&self, id: &ArtifactId) -> bool;

    /// Most recently registered artifact of `artifact_type` for `sample`.
    async fn latest(&self, sample: &SampleId, artifact_type: ArtifactType) -> Option<Artifact>;

    /// Every artifact of `sample`, oldest first.
    async fn list(&self, sample: &SampleId) -> Vec<Artifact>;

    /// Copies an external file or directory into the store as a source
    /// artifact produced by `import`.
    async fn import(
        &self,
        source: &Path,
        sample: &SampleId,
        artifact_type: ArtifactType,
    ) -> Result<Artifact, StoreError> {
        let staging = self.create_staging().await?;
        let result = async {
            copy_payload(source, &staging.output_path()).await?;
            self.ingest(IngestRequest {
                payload: staging.output_path(),
                sample: sample.clone(),
                artifact_type,
                produced_by: IMPORT_PRODUCER.to_string(),
                inputs: Vec::new(),
            })
            .await
        }
        .await;
        self.discard_staging(&staging).await?;
        result
    }
}

/// Filesystem artifact store.
///
/// Layout under the root:
/// `objects/<sample>/<type>/<content-hash>/payload`, the `artifacts.jsonl`
/// index journal, and `staging/<uuid>/` for in-flight outputs.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    index: DashMap<ArtifactId, Artifact>,
    latest: DashMap<(SampleId, ArtifactType), ArtifactId>,
    journal: Journal,
    commit: Mutex<()>,
}

impl FsArtifactStore {
    /// Opens (or creates) a store rooted at `root` and replays its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or journal cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        for dir in [root.join(OBJECTS_DIR), root.join(STAGING_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| StoreError::io(root, e))?;

        let journal_path = root.join(ARTIFACT_JOURNAL);
        let records: Vec<Artifact> = journal::replay(&journal_path).await?;
        let index = DashMap::new();
        let latest = DashMap::new();
        for artifact in records {
            latest.insert(
                (artifact.sample.clone(), artifact.artifact_type),
                artifact.id.clone(),
            );
            index.insert(artifact.id.clone(), artifact);
        }
        tracing::debug!(root = %root.display(), artifacts = index.len(), "Opened artifact store");

        Ok(Self {
            journal: Journal::open(journal_path).await?,
            root,
            index,
            latest,
            commit: Mutex::new(()),
        })
    }

    /// The canonical store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of registered artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn object_path(&self, sample: &SampleId, artifact_type: ArtifactType, content_hash: &str) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(sample.as_str())
            .join(artifact_type.as_str())
            .join(content_hash)
            .join(PAYLOAD_NAME)
    }

    async fn mark_latest(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let key = (artifact.sample.clone(), artifact.artifact_type);
        let changed = self.latest.get(&key).map_or(true, |id| *id != artifact.id);
        if changed {
            self.journal.append(artifact).await?;
            self.latest.insert(key, artifact.id.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn create_staging(&self) -> Result<StagingArea, StoreError> {
        let dir = self.root.join(STAGING_DIR).join(generate_uuid().to_string());
        tokio::fs::create_dir_all(dir.join("work"))
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        Ok(StagingArea { dir })
    }

    async fn discard_staging(&self, staging: &StagingArea) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(staging.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(staging.path(), e)),
        }
    }

    async fn ingest(&self, request: IngestRequest) -> Result<Artifact, StoreError> {
        let empty = || StoreError::EmptyPayload {
            path: request.payload.clone(),
        };
        if !tokio::fs::try_exists(&request.payload).await.unwrap_or(false) {
            return Err(empty());
        }
        let (content_hash, size_bytes) = hashing::hash_payload(&request.payload).await?;
        if size_bytes == 0 {
            return Err(empty());
        }
        let id = hashing::artifact_id(&content_hash, &request.produced_by, &request.inputs);

        let _guard = self.commit.lock().await;
        if let Some(existing) = self.index.get(&id).map(|a| a.clone()) {
            if tokio::fs::try_exists(&existing.location).await.unwrap_or(false) {
                self.mark_latest(&existing).await?;
                tracing::debug!(artifact = %id.short(), "Payload already stored");
                return Ok(existing);
            }
        }

        let location = self.object_path(&request.sample, request.artifact_type, &content_hash);
        if !tokio::fs::try_exists(&location).await.unwrap_or(false) {
            if let Some(parent) = location.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::io(parent, e))?;
            }
            tokio::fs::rename(&request.payload, &location)
                .await
                .map_err(|e| StoreError::io(&location, e))?;
        }

        let artifact = Artifact {
            id: id.clone(),
            artifact_type: request.artifact_type,
            sample: request.sample,
            content_hash,
            location,
            produced_by: request.produced_by,
            inputs: request.inputs,
            size_bytes,
            created_at: now_utc(),
        };
        self.journal.append(&artifact).await?;
        self.latest.insert(
            (artifact.sample.clone(), artifact.artifact_type),
            id.clone(),
        );
        self.index.insert(id, artifact.clone());

        tracing::info!(
            artifact = %artifact.id.short(),
            artifact_type = %artifact.artifact_type,
            sample = %artifact.sample,
            produced_by = %artifact.produced_by,
            size_bytes = artifact.size_bytes,
            "Ingested artifact"
        );
        Ok(artifact)
    }

    async fn get(&self, id: &ArtifactId) -> Option<Artifact> {
        self.index.get(id).map(|a| a.clone())
    }

    async fn contains(&self, id: &ArtifactId) -> bool {
        let Some(location) = self.index.get(id).map(|a| a.location.clone()) else {
            return false;
        };
        tokio::fs::try_exists(&location).await.unwrap_or(false)
    }

    async fn latest(&self, sample: &SampleId, artifact_type: ArtifactType) -> Option<Artifact> {
        let id = self.latest.get(&(sample.clone(), artifact_type))?.clone();
        self.get(&id).await
    }

    async fn list(&self, sample: &SampleId) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self
            .index
            .iter()
            .filter(|a| a.sample == *sample)
            .map(|a| a.clone())
            .collect();
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        artifacts
    }
}

/// Copies a file or directory tree to `dest`.
async fn copy_payload(source: &Path, dest: &Path) -> Result<(), StoreError> {
    let meta = tokio::fs::metadata(source).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::EmptyPayload {
                path: source.to_path_buf(),
            }
        } else {
            StoreError::io(source, e)
        }
    })?;

    if meta.is_file() {
        tokio::fs::copy(source, dest)
            .await
            .map_err(|e| StoreError::io(dest, e))?;
        return Ok(());
    }

    for relative in hashing::list_files(source).await? {
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::copy(source.join(&relative), &target)
            .await
            .map_err(|e| StoreError::io(&target, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> SampleId {
        SampleId::new(id).unwrap()
    }

    async fn write_output(store: &FsArtifactStore, body: &str) -> StagingArea {
        let staging = store.create_staging().await.unwrap();
        tokio::fs::write(staging.output_path(), body).await.unwrap();
        staging
    }

    fn request(staging: &StagingArea, produced_by: &str, inputs: Vec<ArtifactId>) -> IngestRequest {
        IngestRequest {
            payload: staging.output_path(),
            sample: sample("S1"),
            artifact_type: ArtifactType::CcsPredictions,
            produced_by: produced_by.to_string(),
            inputs,
        }
    }

    #[tokio::test]
    async fn test_ingest_moves_payload_into_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let staging = write_output(&store, "peptide,ccs\nSIINFEKL,350.2\n").await;

        let artifact = store.ingest(request(&staging, "ccs", vec![])).await.unwrap();

        assert!(artifact.location.starts_with(store.root().join("objects/S1/ccs_predictions")));
        assert!(artifact.location.ends_with("payload"));
        assert!(!staging.output_path().exists());
        assert!(store.contains(&artifact.id).await);
        assert_eq!(store.latest(&sample("S1"), ArtifactType::CcsPredictions).await.unwrap().id, artifact.id);
    }

    #[tokio::test]
    async fn test_duplicate_ingest_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();

        let first = write_output(&store, "same").await;
        let a = store.ingest(request(&first, "ccs", vec![])).await.unwrap();
        let second = write_output(&store, "same").await;
        let b = store.ingest(request(&second, "ccs", vec![])).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        store.discard_staging(&second).await.unwrap();
        assert!(!second.path().exists());
    }

    #[tokio::test]
    async fn test_same_content_different_provenance_gets_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();

        let first = write_output(&store, "same").await;
        let a = store.ingest(request(&first, "ccs", vec![])).await.unwrap();
        let second = write_output(&store, "same").await;
        let b = store
            .ingest(request(&second, "ccs", vec![ArtifactId::from_hex("ab")]))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.location, b.location);
    }

    #[tokio::test]
    async fn test_empty_or_missing_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();

        let missing = store.create_staging().await.unwrap();
        let err = store.ingest(request(&missing, "ccs", vec![])).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyPayload { .. }));

        let empty = write_output(&store, "").await;
        let err = store.ingest(request(&empty, "ccs", vec![])).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyPayload { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FsArtifactStore::open(dir.path()).await.unwrap();
            let staging = write_output(&store, "rt").await;
            store.ingest(request(&staging, "rt", vec![])).await.unwrap().id
        };

        let reopened = FsArtifactStore::open(dir.path()).await.unwrap();
        assert!(reopened.contains(&id).await);
        assert_eq!(reopened.list(&sample("S1")).await.len(), 1);
        assert!(reopened.list(&sample("S2")).await.is_empty());
    }

    #[tokio::test]
    async fn test_import_directory_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path().join("store")).await.unwrap();

        let run = dir.path().join("sample_1.d");
        tokio::fs::create_dir_all(&run).await.unwrap();
        tokio::fs::write(run.join("analysis.tdf"), b"tdf").await.unwrap();
        tokio::fs::write(run.join("analysis.tdf_bin"), b"frames").await.unwrap();

        let artifact = store.import(&run, &sample("S1"), ArtifactType::RawRun).await.unwrap();
        assert!(artifact.is_imported());
        assert!(artifact.inputs.is_empty());
        assert_eq!(artifact.size_bytes, 9);
        assert!(artifact.location.join("analysis.tdf").exists());
        assert!(run.join("analysis.tdf").exists());

        let again = store.import(&run, &sample("S1"), ArtifactType::RawRun).await.unwrap();
        assert_eq!(again.id, artifact.id);

        let mut staging = tokio::fs::read_dir(store.root().join(STAGING_DIR)).await.unwrap();
        assert!(staging.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reimport_of_older_run_becomes_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path().join("store")).await.unwrap();
        let v1 = dir.path().join("v1.raw");
        let v2 = dir.path().join("v2.raw");
        tokio::fs::write(&v1, b"one").await.unwrap();
        tokio::fs::write(&v2, b"two").await.unwrap();

        let a = store.import(&v1, &sample("S1"), ArtifactType::RawRun).await.unwrap();
        let b = store.import(&v2, &sample("S1"), ArtifactType::RawRun).await.unwrap();
        assert_eq!(store.latest(&sample("S1"), ArtifactType::RawRun).await.unwrap().id, b.id);

        store.import(&v1, &sample("S1"), ArtifactType::RawRun).await.unwrap();
        assert_eq!(store.latest(&sample("S1"), ArtifactType::RawRun).await.unwrap().id, a.id);

        let reopened = FsArtifactStore::open(dir.path().join("store")).await.unwrap();
        assert_eq!(reopened.latest(&sample("S1"), ArtifactType::RawRun).await.unwrap().id, a.id);
    }
}
