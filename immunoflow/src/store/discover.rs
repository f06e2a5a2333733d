//! Discovery of Bruker timsTOF acquisitions on disk.

use crate::core::SampleId;
use crate::errors::StoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File that marks a directory as a timsTOF acquisition.
pub const TDF_MARKER: &str = "analysis.tdf";

/// An acquisition directory and the sample id derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRun {
    /// The acquisition directory.
    pub path: PathBuf,
    /// Directory name without the `.d` suffix, with characters a sample id
    /// cannot hold replaced by `_`. When several acquisitions share that
    /// name, the parent directory name is prepended (`batch1_S1`).
    pub sample: SampleId,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

fn stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    Some(name.strip_suffix(".d").unwrap_or(&name).to_string())
}

/// Derives a sample id from an acquisition directory name.
#[must_use]
pub fn sample_from_dir(path: &Path) -> Option<SampleId> {
    SampleId::new(sanitize(&stem(path)?)).ok()
}

fn qualified_sample(path: &Path) -> Option<SampleId> {
    let parent = path.parent()?.file_name()?.to_string_lossy();
    SampleId::new(sanitize(&format!("{parent}_{}", stem(path)?))).ok()
}

/// Qualifies colliding ids with their parent directory, then rejects any id
/// that is still shared.
fn assign_unique_samples(runs: &mut [DiscoveredRun]) -> Result<(), StoreError> {
    let mut counts: HashMap<SampleId, usize> = HashMap::new();
    for run in runs.iter() {
        *counts.entry(run.sample.clone()).or_default() += 1;
    }
    for run in runs.iter_mut() {
        if counts[&run.sample] > 1 {
            if let Some(qualified) = qualified_sample(&run.path) {
                debug!(path = %run.path.display(), from = %run.sample, to = %qualified, "Qualifying duplicate sample id");
                run.sample = qualified;
            }
        }
    }

    let mut claimed: HashMap<&SampleId, &Path> = HashMap::new();
    for run in runs.iter() {
        if let Some(first) = claimed.insert(&run.sample, &run.path) {
            return Err(StoreError::DuplicateSample {
                sample: run.sample.clone(),
                first: first.to_path_buf(),
                second: run.path.clone(),
            });
        }
    }
    Ok(())
}

/// Recursively finds directories under `root` that contain
/// [`TDF_MARKER`]. Acquisition directories are not searched further.
/// Results are sorted by path and carry distinct sample ids.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if `root` cannot be read, and
/// [`StoreError::DuplicateSample`] if two acquisitions still share an id
/// after qualifying with the parent directory. Unreadable subdirectories
/// are skipped with a warning.
pub fn discover_raw_runs(root: &Path) -> Result<Vec<DiscoveredRun>, StoreError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    let mut first = true;

    while let Some(dir) = pending.pop() {
        if dir.join(TDF_MARKER).is_file() {
            match sample_from_dir(&dir) {
                Some(sample) => {
                    debug!(path = %dir.display(), sample = %sample, "Found acquisition");
                    found.push(DiscoveredRun { path: dir, sample });
                }
                None => warn!(path = %dir.display(), "Cannot derive a sample id; skipping"),
            }
            first = false;
            continue;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if first => return Err(StoreError::io(&dir, e)),
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        first = false;
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                pending.push(entry.path());
            }
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    assign_unique_samples(&mut found)?;
    Ok(found)
}
