//! Destination adapter abstraction.
//!
//! A destination adapter performs the remote call for one destination type. The
//! dispatch engine looks adapters up by the record's destination tag in an
//! [`AdapterRegistry`], so new destinations can be added without touching the engine.
//!
//! Adapters never retry: they report each failure as either retryable or terminal
//! and the retry controller decides what happens next.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::DestinationConfig;
use crate::error::Result;

pub mod http;
pub mod mock;

pub use http::HttpAdapter;
pub use mock::{MockAdapter, MockCall};

/// Whether a failed send may succeed if tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Throttling, transient network errors, timeouts, temporary unavailability
    Retryable,
    /// Authentication failures, permanently invalid requests, explicit refusals
    Terminal,
}

/// A failure reported by a destination adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AdapterFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

impl std::fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::Retryable => "retryable",
            FailureKind::Terminal => "terminal",
        };
        write!(f, "{} ({})", self.message, kind)
    }
}

/// Result of a single send.
pub type SendResult = std::result::Result<Value, AdapterFailure>;

/// Trait for sending one request to a destination.
///
/// # Example
/// ```ignore
/// let adapter = HttpAdapter::new(&destination_config)?;
/// match adapter.send("gpt-4o", &body, &parameters).await {
///     Ok(response) => println!("{response}"),
///     Err(failure) if failure.is_retryable() => { /* the engine will re-enqueue */ }
///     Err(failure) => eprintln!("gave up: {failure}"),
/// }
/// ```
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Send one request.
    ///
    /// `body` and `parameters` are passed exactly as they appear in the batch source.
    async fn send(&self, target_model: &str, body: &Value, parameters: &Value) -> SendResult;
}

/// Maps destination tags to adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn DestinationAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one [`HttpAdapter`] per configured destination.
    pub fn from_config(destinations: &BTreeMap<String, DestinationConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (tag, config) in destinations {
            registry.register(tag.clone(), Arc::new(HttpAdapter::new(config)?));
            tracing::debug!(destination = %tag, url = %config.url, "Registered HTTP destination");
        }
        Ok(registry)
    }

    /// Register an adapter, replacing any previous adapter for the same tag.
    pub fn register(&mut self, tag: impl Into<String>, adapter: Arc<dyn DestinationAdapter>) {
        self.adapters.insert(tag.into(), adapter);
    }

    /// Builder-style variant of [`AdapterRegistry::register`].
    pub fn with(mut self, tag: impl Into<String>, adapter: Arc<dyn DestinationAdapter>) -> Self {
        self.register(tag, adapter);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn DestinationAdapter>> {
        self.adapters.get(tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.adapters.contains_key(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
