//! Generic JSON-over-HTTP destination adapter.
//!
//! Posts the record body to `url + path` with an optional bearer token, which is
//! enough for OpenAI-compatible inference endpoints. Status codes are mapped onto
//! retryable and terminal failures the same way the batch daemon always has:
//! server errors (5xx), rate limits (429) and timeouts (408) are worth retrying,
//! anything else is not.

use async_trait::async_trait;
use serde_json::Value;

use super::{AdapterFailure, DestinationAdapter, FailureKind, SendResult};
use crate::config::DestinationConfig;
use crate::error::Result;

/// Production adapter using reqwest.
#[derive(Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpAdapter {
    /// Create an adapter for one configured destination.
    pub fn new(config: &DestinationConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{}", config.url.trim_end_matches('/'), config.path),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Classify a non-success status code.
pub fn classify_status(status: u16) -> FailureKind {
    if status >= 500 || status == 429 || status == 408 {
        FailureKind::Retryable
    } else {
        FailureKind::Terminal
    }
}

/// Build the JSON payload sent upstream.
///
/// The body is sent as-is, with `model` filled in from the target model when the
/// body doesn't already name one, and the parameters object merged on top.
/// Non-object bodies are sent untouched.
pub fn build_payload(target_model: &str, body: &Value, parameters: &Value) -> Value {
    let Value::Object(fields) = body else {
        return body.clone();
    };

    let mut payload = fields.clone();
    if !target_model.is_empty() && !payload.contains_key("model") {
        payload.insert("model".to_string(), Value::String(target_model.to_string()));
    }
    if let Value::Object(params) = parameters {
        for (key, value) in params {
            payload.insert(key.clone(), value.clone());
        }
    }
    Value::Object(payload)
}

fn classify_transport_error(e: &reqwest::Error) -> AdapterFailure {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        AdapterFailure::retryable(format!("transport error: {e}"))
    } else {
        AdapterFailure::terminal(format!("request error: {e}"))
    }
}

#[async_trait]
impl DestinationAdapter for HttpAdapter {
    #[tracing::instrument(skip(self, body, parameters), fields(url = %self.url))]
    async fn send(&self, target_model: &str, body: &Value, parameters: &Value) -> SendResult {
        let payload = build_payload(target_model, body, parameters);

        let mut req = self.client.post(&self.url).json(&payload);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, "HTTP request failed");
            classify_transport_error(&e)
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| classify_transport_error(&e))?;

        tracing::debug!(status, response_len = text.len(), "HTTP request completed");

        if !(200..300).contains(&status) {
            let snippet: String = text.chars().take(200).collect();
            return Err(AdapterFailure {
                kind: classify_status(status),
                message: format!("HTTP {status}: {snippet}"),
            });
        }

        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> HttpAdapter {
        HttpAdapter::new(&DestinationConfig {
            url: server.uri(),
            path: "/v1/chat/completions".to_string(),
            api_key: Some("sk-test".to_string()),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(500), FailureKind::Retryable);
        assert_eq!(classify_status(503), FailureKind::Retryable);
        assert_eq!(classify_status(429), FailureKind::Retryable);
        assert_eq!(classify_status(408), FailureKind::Retryable);
        assert_eq!(classify_status(400), FailureKind::Terminal);
        assert_eq!(classify_status(401), FailureKind::Terminal);
        assert_eq!(classify_status(404), FailureKind::Terminal);
    }

    #[test]
    fn test_build_payload() {
        let payload = build_payload(
            "gpt-4o",
            &json!({"messages": [{"role": "user", "content": "hi"}]}),
            &json!({"temperature": 0.5}),
        );
        assert_eq!(payload["model"], "gpt-4o");
        assert_eq!(payload["temperature"], 0.5);
        assert_eq!(payload["messages"][0]["content"], "hi");

        // An explicit model in the body wins
        let payload = build_payload("gpt-4o", &json!({"model": "other"}), &json!({}));
        assert_eq!(payload["model"], "other");

        // Empty target model adds nothing
        let payload = build_payload("", &json!({"input": "x"}), &Value::Null);
        assert_eq!(payload, json!({"input": "x"}));

        // Non-object bodies pass through
        assert_eq!(build_payload("m", &json!("raw"), &json!({})), json!("raw"));
    }

    #[tokio::test]
    async fn test_success_returns_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(json!({"model": "gpt-4o", "prompt": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let response = adapter_for(&server)
            .send("gpt-4o", &json!({"prompt": "hi"}), &json!({}))
            .await
            .unwrap();
        assert_eq!(response, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_non_json_body_becomes_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&server)
            .await;

        let response = adapter_for(&server)
            .send("m", &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(response, json!("plain"));
    }

    #[tokio::test]
    async fn test_rate_limited_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let failure = adapter_for(&server)
            .send("m", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Retryable);
        assert_eq!(failure.message, "HTTP 429: slow down");
    }

    #[tokio::test]
    async fn test_unauthorized_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let failure = adapter_for(&server)
            .send("m", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Terminal);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let adapter = HttpAdapter::new(&DestinationConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        })
        .unwrap();

        let failure = adapter.send("m", &json!({}), &json!({})).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Retryable);
    }
}
