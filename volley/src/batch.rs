//! Batch sources and their parsing.
//!
//! A batch source is a JSON Lines file: one request entry per line. Parsing is
//! pure and all-or-nothing, so any structural problem rejects the whole batch
//! before a single request is sent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{BatchError, Error, Result};
use crate::types::{BatchState, RequestRecord, RESULT_KEYS};

/// A named, ordered collection of request records.
#[derive(Debug, Clone)]
pub struct Batch {
    /// File stem of the source, used to name its result log and archive
    pub name: String,
    pub source: PathBuf,
    pub records: Vec<RequestRecord>,
    pub state: BatchState,
    /// Digest of the source contents, tying a result log to this exact source
    pub fingerprint: String,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Name of a batch, derived from its source path.
pub fn batch_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Short hex digest of a batch source's contents.
pub fn fingerprint(contents: &[u8]) -> String {
    Sha256::digest(contents)[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Parse the contents of a batch source.
///
/// `is_known_destination` decides whether a destination tag has an adapter.
/// Blank lines are ignored; line numbers in errors are 1-based.
pub fn parse_records<F>(
    contents: &str,
    is_known_destination: F,
) -> std::result::Result<Vec<RequestRecord>, BatchError>
where
    F: Fn(&str) -> bool,
{
    let mut records = Vec::new();
    let mut seen = HashSet::new();

    for (index, line) in contents.lines().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: RequestRecord =
            serde_json::from_str(line).map_err(|e| BatchError::Malformed {
                line: line_number,
                message: e.to_string(),
            })?;

        if let Some(key) = RESULT_KEYS.iter().find(|key| record.extra.contains_key(**key)) {
            return Err(BatchError::Malformed {
                line: line_number,
                message: format!("'{key}' is reserved for result entries"),
            });
        }

        if record.destination.is_empty() {
            return Err(BatchError::Malformed {
                line: line_number,
                message: "destination must not be empty".to_string(),
            });
        }

        if !seen.insert(record.id) {
            return Err(BatchError::DuplicateId {
                line: line_number,
                id: record.id,
            });
        }

        if !is_known_destination(&record.destination) {
            return Err(BatchError::UnknownDestination {
                line: line_number,
                destination: record.destination,
            });
        }

        records.push(record);
    }

    Ok(records)
}

/// Read and validate a batch source from disk.
#[tracing::instrument(skip(path, is_known_destination), fields(source = %path.display()))]
pub async fn read_batch<F>(path: &Path, is_known_destination: F) -> Result<Batch>
where
    F: Fn(&str) -> bool,
{
    let name = batch_name(path);
    let contents = tokio::fs::read_to_string(path).await?;

    let records = parse_records(&contents, is_known_destination).map_err(|source| {
        Error::Structural {
            batch: name.clone(),
            source,
        }
    })?;

    tracing::debug!(batch = %name, records = records.len(), "Read batch");

    Ok(Batch {
        name,
        source: path.to_path_buf(),
        records,
        state: BatchState::NotStarted,
        fingerprint: fingerprint(contents.as_bytes()),
    })
}
