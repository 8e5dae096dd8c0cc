use std::collections::HashSet;
use std::future::Future;

use crate::error::Result;
use crate::types::{RecordId, ResultRecord};

pub mod in_memory;
pub mod jsonl;


pub use in_memory::InMemoryResultSink;
pub use jsonl::JsonlResultLog;

/// Append-only destination for finished records.
///
/// The dispatch engine calls [`ResultSink::append`] once per finished record, from
/// many tasks at once; implementations serialize the writes. A write must be
/// durable before `append` returns, so that [`ResultSink::finished_ids`] after a
/// crash reflects everything the engine considered finished.
pub trait ResultSink: Send + Sync {
    /// Durably append one result.
    ///
    /// # Errors
    /// - `Writer` - if the result could not be persisted. The engine treats this as
    ///   fatal for the batch.
    fn append(&self, result: &ResultRecord) -> impl Future<Output = Result<()>> + Send;

    /// Ids that already have a result, used to resume a partially drained batch.
    fn finished_ids(&self) -> impl Future<Output = Result<HashSet<RecordId>>> + Send;
}
