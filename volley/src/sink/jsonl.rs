//! JSON Lines result log.
//!
//! One result entry per line, appended in completion order. Each append is
//! flushed and synced to disk before it is acknowledged. A crash can at worst
//! leave a torn final line; replay ignores lines it cannot parse, and the next
//! writer starts on a fresh line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::ResultSink;
use crate::error::{Error, Result};
use crate::types::{RecordId, ResultRecord};

/// Result log backed by an append-only JSON Lines file.
pub struct JsonlResultLog {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Deserialize)]
struct LoggedId {
    id: RecordId,
}

impl JsonlResultLog {
    /// Open (or create) the log at `path` for appending.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let torn_tail = match tokio::fs::read(&path).await {
            Ok(contents) => contents.last().is_some_and(|byte| *byte != b'\n'),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(writer_error(&path, e)),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| writer_error(&path, e))?;

        if torn_tail {
            tracing::warn!(path = %path.display(), "Result log ends with a partial entry, starting a new line");
            file.write_all(b"\n")
                .await
                .map_err(|e| writer_error(&path, e))?;
            file.sync_data().await.map_err(|e| writer_error(&path, e))?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replay a result log and collect the ids it already holds.
///
/// A missing file holds no ids. Unparseable lines are skipped with a warning.
pub async fn replay(path: &Path) -> Result<HashSet<RecordId>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = HashSet::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LoggedId>(line) {
            Ok(logged) => {
                ids.insert(logged.id);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable result log entry"
                );
            }
        }
    }
    Ok(ids)
}

fn writer_error(path: &Path, source: std::io::Error) -> Error {
    Error::Writer {
        path: path.to_path_buf(),
        source,
    }
}

impl ResultSink for JsonlResultLog {
    async fn append(&self, result: &ResultRecord) -> Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| writer_error(&self.path, e))?;
        file.flush().await.map_err(|e| writer_error(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| writer_error(&self.path, e))?;

        tracing::trace!(record_id = %result.id(), path = %self.path.display(), "Appended result");
        Ok(())
    }

    async fn finished_ids(&self) -> Result<HashSet<RecordId>> {
        // Hold the lock so no append interleaves with the replay
        let _file = self.file.lock().await;
        replay(&self.path).await
    }
}
