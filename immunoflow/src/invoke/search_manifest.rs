//! FragPipe-style search manifests.
//!
//! A search engine run over converted spectra takes a tab-separated manifest
//! with one row per mzML file: `path`, experiment, replicate, data type.
//! Replicates are numbered from 1 in path order. The manifest is written to
//! the attempt's work directory before the collaborator starts.

use super::{InvocationError, InvocationRequest};
use crate::errors::Diagnostic;
use std::path::{Path, PathBuf};

/// Extension of converted spectra files, matched case-sensitively.
pub const MZML_EXTENSION: &str = "mzML";
/// Experiment column value.
pub const EXPERIMENT: &str = "exp";
/// Config option holding the acquisition data type.
pub const DATA_TYPE_OPTION: &str = "data_type";

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    /// Spectra file.
    pub path: PathBuf,
    /// Experiment name.
    pub experiment: String,
    /// 1-based replicate number.
    pub replicate: usize,
    /// Acquisition data type, e.g. `DDA`.
    pub data_type: String,
}

impl ManifestRow {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\n",
            self.path.display(),
            self.experiment,
            self.replicate,
            self.data_type
        )
    }
}

/// Where the manifest for `request` is written: `<work_dir>/<sample>_manifest.tsv`.
#[must_use]
pub fn manifest_path(request: &InvocationRequest) -> PathBuf {
    request.work_dir.join(format!("{}_manifest.tsv", request.sample))
}

/// Lists the spectra in a converted payload, sorted by path.
///
/// A directory payload contributes its top-level `*.mzML` files. A file
/// payload is taken as a single spectra file whatever its name.
///
/// # Errors
///
/// Returns the I/O error if the payload cannot be read.
pub async fn collect_spectra(payload: &Path) -> std::io::Result<Vec<PathBuf>> {
    if tokio::fs::metadata(payload).await?.is_file() {
        return Ok(vec![payload.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(payload).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_mzml = path.extension().is_some_and(|ext| ext == MZML_EXTENSION);
        if is_mzml && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Numbers `files` as replicates of one experiment.
#[must_use]
pub fn manifest_rows(files: &[PathBuf], data_type: &str) -> Vec<ManifestRow> {
    files
        .iter()
        .enumerate()
        .map(|(index, path)| ManifestRow {
            path: path.clone(),
            experiment: EXPERIMENT.to_string(),
            replicate: index + 1,
            data_type: data_type.to_string(),
        })
        .collect()
}

/// Writes the manifest for the first input of `request`.
///
/// # Errors
///
/// Fails permanently when the request has no input, no `data_type` value,
/// or the payload holds no mzML files. Filesystem errors are transient.
pub async fn write_search_manifest(request: &InvocationRequest) -> Result<PathBuf, InvocationError> {
    let permanent = |message: String| InvocationError::permanent(Diagnostic::new(message));

    let input = request
        .inputs
        .first()
        .ok_or_else(|| permanent(format!("stage '{}' has no input to list", request.stage.id)))?;
    let data_type = request
        .config
        .get(DATA_TYPE_OPTION)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| permanent(format!("stage '{}' has no '{DATA_TYPE_OPTION}' value", request.stage.id)))?;

    let files = collect_spectra(&input.path).await.map_err(|e| {
        InvocationError::transient(Diagnostic::new(format!(
            "cannot list spectra in {}: {e}",
            input.path.display()
        )))
    })?;
    if files.is_empty() {
        return Err(permanent(format!(
            "no .{MZML_EXTENSION} files in {}",
            input.path.display()
        )));
    }

    let rows = manifest_rows(&files, data_type);
    let body: String = rows.iter().map(ManifestRow::to_line).collect();
    let path = manifest_path(request);
    tokio::fs::write(&path, body).await.map_err(|e| {
        InvocationError::transient(Diagnostic::new(format!(
            "cannot write search manifest {}: {e}",
            path.display()
        )))
    })?;
    tracing::debug!(
        stage = %request.stage.id,
        sample = %request.sample,
        files = rows.len(),
        manifest = %path.display(),
        "Wrote search manifest"
    );
    Ok(path)
}
