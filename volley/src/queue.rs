//! Grouping of batch records into throughput-limited queues.
//!
//! Records are keyed by their explicit `group` when present, otherwise by
//! `(destination, target_model)`. Each queue carries the requests-per-minute
//! budget resolved for it, and keeps its records in batch order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::types::{RecordId, RequestRecord};

/// Longest spacing a rate limit may ask for: one request per day.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// A requests-per-minute budget. Always positive and finite, with an interval
/// of at most [`MAX_INTERVAL`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RateLimit(f64);

#[derive(Debug, Error, PartialEq)]
#[error("rate limit must be a positive number of requests per minute, at least one per day, got {0}")]
pub struct InvalidRateLimit(pub f64);

impl RateLimit {
    pub fn new(rpm: f64) -> std::result::Result<Self, InvalidRateLimit> {
        if !(rpm.is_finite() && rpm > 0.0) {
            return Err(InvalidRateLimit(rpm));
        }
        match Duration::try_from_secs_f64(60.0 / rpm) {
            Ok(interval) if interval <= MAX_INTERVAL => Ok(Self(rpm)),
            _ => Err(InvalidRateLimit(rpm)),
        }
    }

    pub fn rpm(&self) -> f64 {
        self.0
    }

    /// Minimum spacing between two sends: 60 / rpm seconds.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / self.0)
    }
}

/// Identity of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKey {
    /// Explicit group override
    Group(String),
    /// Implicit grouping by destination and model
    Destination {
        destination: String,
        target_model: String,
    },
}

impl QueueKey {
    pub fn for_record(record: &RequestRecord) -> Self {
        match &record.group {
            Some(group) => QueueKey::Group(group.clone()),
            None => QueueKey::Destination {
                destination: record.destination.clone(),
                target_model: record.target_model.clone(),
            },
        }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKey::Group(group) => write!(f, "group:{group}"),
            QueueKey::Destination {
                destination,
                target_model,
            } if target_model.is_empty() => write!(f, "{destination}"),
            QueueKey::Destination {
                destination,
                target_model,
            } => write!(f, "{destination}/{target_model}"),
        }
    }
}

/// A record waiting for its next attempt.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub record: Arc<RequestRecord>,
    /// Attempts already made, so the next one is `attempts_made + 1`
    pub attempts_made: u32,
}

impl PendingRecord {
    pub fn new(record: RequestRecord) -> Self {
        Self {
            record: Arc::new(record),
            attempts_made: 0,
        }
    }
}

/// A throughput-limited queue of records.
#[derive(Debug, Clone)]
pub struct Queue {
    pub key: QueueKey,
    pub rate_limit: RateLimit,
    pub pending: VecDeque<PendingRecord>,
}

impl Queue {
    pub fn interval(&self) -> Duration {
        self.rate_limit.interval()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop records that already have a result, returning how many were dropped.
    pub fn skip_finished(&mut self, finished: &HashSet<RecordId>) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|pending| !finished.contains(&pending.record.id));
        before - self.pending.len()
    }
}

/// Partition records into queues, in order of each queue's first record.
///
/// Rate limits are resolved here, once per batch. A group whose members would
/// resolve to different budgets (e.g. it mixes destinations and has no
/// `rate_limits.groups` entry) is a configuration error.
pub fn group_records(records: Vec<RequestRecord>, limits: &RateLimitConfig) -> Result<Vec<Queue>> {
    let mut queues: Vec<Queue> = Vec::new();
    let mut index: HashMap<QueueKey, usize> = HashMap::new();

    for record in records {
        let key = QueueKey::for_record(&record);
        let rate_limit =
            limits.resolve(record.group.as_deref(), &record.destination, &record.target_model)?;

        match index.get(&key) {
            Some(&i) => {
                let queue = &mut queues[i];
                if queue.rate_limit != rate_limit {
                    return Err(Error::Config(format!(
                        "queue {} resolves to conflicting rate limits ({} and {} rpm); \
                         configure rate_limits.groups for it",
                        queue.key,
                        queue.rate_limit.rpm(),
                        rate_limit.rpm()
                    )));
                }
                queue.pending.push_back(PendingRecord::new(record));
            }
            None => {
                index.insert(key.clone(), queues.len());
                queues.push(Queue {
                    key,
                    rate_limit,
                    pending: VecDeque::from([PendingRecord::new(record)]),
                });
            }
        }
    }

    tracing::debug!(
        queues = queues.len(),
        total_records = queues.iter().map(Queue::len).sum::<usize>(),
        "Grouped records into queues"
    );

    Ok(queues)
}
