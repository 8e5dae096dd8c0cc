//! Rate-limited batch dispatch to remote inference endpoints.
//!
//! Batches are JSON Lines files of request entries. Each batch is validated as
//! a whole, split into queues by rate-limit key, and drained: every queue sends
//! one request per interval derived from its requests-per-minute budget, with
//! retryable failures re-enqueued until `max_attempts` is reached. Every
//! finished record is appended durably to the batch's result log as soon as it
//! finishes, so an interrupted drain resumes where it stopped.
//!
//! A [`Pipeline`] watches an input directory, drains new batches and archives
//! them together with their result logs.
//!
//! # Example
//! ```ignore
//! use volley::{AdapterRegistry, Dispatcher, EngineConfig, InMemoryResultSink, MockAdapter};
//!
//! let registry = AdapterRegistry::new().with("openai", Arc::new(MockAdapter::echo()));
//! let dispatcher = Dispatcher::new(registry, EngineConfig::default());
//!
//! let queues = group_records(records, &config.rate_limits)?;
//! let summary = dispatcher.drain("nightly", queues, Arc::new(InMemoryResultSink::new())).await?;
//! ```

pub mod adapter;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use adapter::{
    AdapterFailure, AdapterRegistry, DestinationAdapter, FailureKind, HttpAdapter, MockAdapter,
};
pub use batch::{read_batch, Batch};
pub use config::{Args, Config, DrainMode, RateLimitConfig};
pub use engine::{Dispatcher, DrainSummary, EngineConfig};
pub use error::{BatchError, Error, Result};
pub use pipeline::{Pipeline, PipelineConfig, PipelineState, PipelineStats};
pub use queue::{group_records, Queue, QueueKey, RateLimit};
pub use retry::RetryPolicy;
pub use sink::{InMemoryResultSink, JsonlResultLog, ResultSink};
pub use types::*;
