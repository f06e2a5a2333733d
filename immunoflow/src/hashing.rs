//! Content addressing helpers.
//!
//! Artifact ids, configuration hashes and checkpoint keys are all hex
//! SHA-256 digests. Configuration maps are hashed through their JSON
//! encoding; `serde_json::Map` keeps keys sorted, so the encoding is
//! canonical.

use crate::core::ArtifactId;
use crate::errors::StoreError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of a resolved stage configuration.
#[must_use]
pub fn hash_config(config: &serde_json::Map<String, serde_json::Value>) -> String {
    let json = serde_json::Value::Object(config.clone()).to_string();
    sha256_hex(json.as_bytes())
}

/// Checkpoint key of a stage invocation.
///
/// Input ids are sorted so the key only depends on *which* artifacts were
/// consumed. The key changes iff the stage id, an input id, or the config
/// hash changes.
#[must_use]
pub fn cache_key(stage_id: &str, input_ids: &[ArtifactId], config_hash: &str) -> String {
    let mut sorted: Vec<&str> = input_ids.iter().map(ArtifactId::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(b"checkpoint:v1\n");
    hasher.update(stage_id.as_bytes());
    hasher.update(b"\n");
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b",");
    }
    hasher.update(b"\n");
    hasher.update(config_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Identifier of an artifact from its payload hash and provenance.
#[must_use]
pub fn artifact_id(content_hash: &str, produced_by: &str, inputs: &[ArtifactId]) -> ArtifactId {
    let mut sorted: Vec<&str> = inputs.iter().map(ArtifactId::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(b"artifact:v1\n");
    hasher.update(content_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(produced_by.as_bytes());
    hasher.update(b"\n");
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b",");
    }
    ArtifactId::from_hex(hex::encode(hasher.finalize()))
}

/// Hashes a payload file or directory tree, returning `(hash, size_bytes)`.
///
/// A plain file hashes to the SHA-256 of its bytes. A directory hashes to
/// the SHA-256 of a manifest listing every file's relative path and hash in
/// sorted order, so renaming or editing any file changes the result.
pub async fn hash_payload(path: &Path) -> Result<(String, u64), StoreError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    if meta.is_file() {
        return hash_file(path).await;
    }

    let mut files = list_files(path).await?;
    files.sort();

    let mut manifest = Sha256::new();
    manifest.update(b"dir:v1\n");
    let mut total = 0u64;
    for relative in files {
        let (hash, size) = hash_file(&path.join(&relative)).await?;
        total += size;
        manifest.update(relative_key(&relative).as_bytes());
        manifest.update(b"\0");
        manifest.update(hash.as_bytes());
        manifest.update(b"\n");
    }
    Ok((hex::encode(manifest.finalize()), total))
}

async fn hash_file(path: &Path) -> Result<(String, u64), StoreError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(|e| StoreError::io(path, e))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Lists regular files under `root` as paths relative to it.
pub(crate) async fn list_files(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut found = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let dir = root.join(&relative);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(entry.path(), e))?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                found.push(child);
            }
        }
    }
    Ok(found)
}

fn relative_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
