//! In-memory result sink.
//!
//! Suitable for tests and for embedding the engine where results are consumed
//! directly. Results are lost on restart.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ResultSink;
use crate::error::{Error, Result};
use crate::types::{RecordId, ResultRecord};

/// In-memory implementation of the ResultSink trait.
///
/// Can be told to start failing after a number of successful writes, to
/// exercise the engine's handling of durability failures.
#[derive(Clone, Default)]
pub struct InMemoryResultSink {
    results: Arc<Mutex<Vec<ResultRecord>>>,
    preexisting: Arc<Mutex<HashSet<RecordId>>>,
    fail_after: Option<usize>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose appends fail once `writes` results have been stored.
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }

    /// Sink that reports `ids` as already finished, as if replayed from an earlier run.
    pub fn with_finished(ids: impl IntoIterator<Item = RecordId>) -> Self {
        let sink = Self::default();
        sink.preexisting.lock().extend(ids);
        sink
    }

    /// Results appended so far, in completion order.
    pub fn results(&self) -> Vec<ResultRecord> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

impl ResultSink for InMemoryResultSink {
    async fn append(&self, result: &ResultRecord) -> Result<()> {
        let mut results = self.results.lock();
        if self.fail_after.is_some_and(|limit| results.len() >= limit) {
            return Err(Error::Writer {
                path: "<memory>".into(),
                source: std::io::Error::other("injected write failure"),
            });
        }
        results.push(result.clone());
        Ok(())
    }

    async fn finished_ids(&self) -> Result<HashSet<RecordId>> {
        let mut ids = self.preexisting.lock().clone();
        ids.extend(self.results.lock().iter().map(ResultRecord::id));
        Ok(ids)
    }
}
