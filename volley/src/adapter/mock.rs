//! Mock destination adapter for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::{AdapterFailure, DestinationAdapter, SendResult};

type Handler = Arc<dyn Fn(&str, &Value, &Value) -> SendResult + Send + Sync>;

/// Mock adapter for testing.
///
/// Responses can be scripted per target model (returned in FIFO order), or
/// computed by a fallback handler. Every call is recorded along with the
/// (possibly paused) tokio clock reading at which it was made.
///
/// # Example
/// ```ignore
/// let mock = MockAdapter::new();
/// mock.add_response("gpt-4o", Ok(json!({"choices": []})));
/// mock.add_response("gpt-4o", Err(AdapterFailure::retryable("HTTP 503")));
/// ```
#[derive(Clone, Default)]
pub struct MockAdapter {
    responses: Arc<Mutex<HashMap<String, VecDeque<SendResult>>>>,
    fallback: Option<Handler>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// Record of a call made to the mock adapter.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub target_model: String,
    pub body: Value,
    pub parameters: Value,
    pub at: Instant,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter that answers every call with the given handler.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value, &Value) -> SendResult + Send + Sync + 'static,
    {
        Self {
            fallback: Some(Arc::new(handler)),
            ..Self::default()
        }
    }

    /// Adapter that echoes the body back as the response.
    pub fn echo() -> Self {
        Self::with_handler(|_, body, _| Ok(body.clone()))
    }

    /// Queue a response for a target model. Scripted responses take precedence
    /// over the fallback handler.
    pub fn add_response(&self, target_model: &str, response: SendResult) {
        self.responses
            .lock()
            .entry(target_model.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls whose body satisfies the predicate, in call order.
    pub fn calls_matching(&self, predicate: impl Fn(&Value) -> bool) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| predicate(&call.body))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DestinationAdapter for MockAdapter {
    async fn send(&self, target_model: &str, body: &Value, parameters: &Value) -> SendResult {
        self.calls.lock().push(MockCall {
            target_model: target_model.to_string(),
            body: body.clone(),
            parameters: parameters.clone(),
            at: Instant::now(),
        });

        let scripted = self
            .responses
            .lock()
            .get_mut(target_model)
            .and_then(VecDeque::pop_front);
        if let Some(response) = scripted {
            return response;
        }

        match &self.fallback {
            Some(handler) => handler(target_model, body, parameters),
            None => Err(AdapterFailure::terminal(format!(
                "No mock response configured for {target_model}"
            ))),
        }
    }
}
