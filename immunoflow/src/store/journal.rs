//! Append-only JSON-lines journals.

use crate::errors::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Reads every well-formed record of a journal.
///
/// A missing file reads as empty. Lines that do not parse (a torn trailing
/// write after a crash) are skipped with a warning.
pub(crate) async fn replay<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut records = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(
                journal = %path.display(),
                line = number + 1,
                error = %e,
                "Skipping unreadable journal line"
            ),
        }
    }
    Ok(records)
}

/// Serialized appender for one journal file.
#[derive(Debug)]
pub(crate) struct Journal {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl Journal {
    /// Opens `path` for appending, creating it if needed.
    ///
    /// If the file ends in a torn line, a newline is written first so the
    /// next record starts on its own line.
    pub(crate) async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let needs_newline = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes.last().is_some_and(|b| *b != b'\n'),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if needs_newline {
            file.write_all(b"\n").await.map_err(|e| StoreError::io(&path, e))?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one record and syncs it to disk.
    pub(crate) async fn append<T: Serialize + Sync>(&self, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        let journal = Journal::open(&path).await.unwrap();
        journal.append(&Entry { n: 1 }).await.unwrap();
        journal.append(&Entry { n: 2 }).await.unwrap();

        let entries: Vec<Entry> = replay(&path).await.unwrap();
        assert_eq!(entries, vec![Entry { n: 1 }, Entry { n: 2 }]);
    }

    #[tokio::test]
    async fn test_missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<Entry> = replay(&dir.path().join("absent.jsonl")).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_skipped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        tokio::fs::write(&path, b"{\"n\":1}\n{\"n\":").await.unwrap();

        let entries: Vec<Entry> = replay(&path).await.unwrap();
        assert_eq!(entries, vec![Entry { n: 1 }]);

        let journal = Journal::open(&path).await.unwrap();
        journal.append(&Entry { n: 3 }).await.unwrap();
        let entries: Vec<Entry> = replay(&path).await.unwrap();
        assert_eq!(entries, vec![Entry { n: 1 }, Entry { n: 3 }]);
    }
}
