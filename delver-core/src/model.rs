//! Language model interface.
//!
//! The engine binds five logical endpoints keyed by role; each role carries
//! its own sampling temperature and may point at a different model. The only
//! capability required of an endpoint is prompt-in, text-out, with optional
//! streaming of output tokens.

use crate::error::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Logical model endpoint roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Planner,
    SearcherAnalyzer,
    Analyzer,
    Writer,
    Critic,
}

impl ModelRole {
    /// Fixed sampling temperature for this role.
    pub fn temperature(&self) -> f32 {
        match self {
            ModelRole::Planner => 0.3,
            ModelRole::SearcherAnalyzer => 0.5,
            ModelRole::Analyzer => 0.3,
            ModelRole::Writer => 0.7,
            ModelRole::Critic => 0.2,
        }
    }

    /// All roles, in a stable order.
    pub fn all() -> [ModelRole; 5] {
        [
            ModelRole::Planner,
            ModelRole::SearcherAnalyzer,
            ModelRole::Analyzer,
            ModelRole::Writer,
            ModelRole::Critic,
        ]
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRole::Planner => write!(f, "planner"),
            ModelRole::SearcherAnalyzer => write!(f, "searcher_analyzer"),
            ModelRole::Analyzer => write!(f, "analyzer"),
            ModelRole::Writer => write!(f, "writer"),
            ModelRole::Critic => write!(f, "critic"),
        }
    }
}

/// Token usage reported by an endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A request to a model endpoint.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

impl ModelRequest {
    /// Build a request for a role, using the role's fixed temperature.
    pub fn for_role(role: ModelRole, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: role.temperature(),
            max_tokens: None,
        }
    }
}

/// A completed model response.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// A language model endpoint.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Perform a streaming completion, sending output tokens to `tx` as they
    /// arrive and returning the assembled response.
    ///
    /// The default implementation completes non-streaming and forwards the
    /// whole text as a single token.
    async fn complete_streaming(
        &self,
        request: ModelRequest,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<ModelResponse, ModelError> {
        let response = self.complete(request).await?;
        let _ = tx.send(response.text.clone());
        Ok(response)
    }

    /// Name of the backing model, for logging.
    fn name(&self) -> &str;
}

/// Retry policy for transient model and provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with backoff retry on transient errors.
///
/// Permanent errors (auth, parse) return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ModelError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff_ms = (config.initial_backoff_ms as f64
                    * config.backoff_multiplier.powi(attempt as i32))
                    as u64;
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying model call after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// The set of role-bound model endpoints a run executes against.
#[derive(Clone)]
pub struct ModelSet {
    endpoints: HashMap<ModelRole, Arc<dyn ModelEndpoint>>,
    retry: RetryConfig,
}

impl ModelSet {
    /// Bind every role to the same endpoint.
    pub fn uniform(endpoint: Arc<dyn ModelEndpoint>) -> Self {
        let mut endpoints = HashMap::new();
        for role in ModelRole::all() {
            endpoints.insert(role, Arc::clone(&endpoint));
        }
        Self {
            endpoints,
            retry: RetryConfig::default(),
        }
    }

    /// Rebind one role to a dedicated endpoint.
    pub fn with_role(mut self, role: ModelRole, endpoint: Arc<dyn ModelEndpoint>) -> Self {
        self.endpoints.insert(role, endpoint);
        self
    }

    /// Override the retry policy.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Complete a prompt against a role's endpoint with timeout and one
    /// transient retry.
    pub async fn complete(
        &self,
        role: ModelRole,
        prompt: &str,
        timeout_ms: u64,
    ) -> Result<ModelResponse, ModelError> {
        let endpoint = self.endpoint(role)?;
        let request = ModelRequest::for_role(role, prompt);
        with_retry(&self.retry, || {
            let endpoint = Arc::clone(&endpoint);
            let request = request.clone();
            async move {
                tokio::time::timeout(Duration::from_millis(timeout_ms), endpoint.complete(request))
                    .await
                    .map_err(|_| ModelError::Timeout { timeout_ms })?
            }
        })
        .await
    }

    /// Streaming completion against a role's endpoint with timeout. Not
    /// retried: tokens already forwarded cannot be recalled.
    pub async fn complete_streaming(
        &self,
        role: ModelRole,
        prompt: &str,
        timeout_ms: u64,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<ModelResponse, ModelError> {
        let endpoint = self.endpoint(role)?;
        let request = ModelRequest::for_role(role, prompt);
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            endpoint.complete_streaming(request, tx),
        )
        .await
        .map_err(|_| ModelError::Timeout { timeout_ms })?
    }

    fn endpoint(&self, role: ModelRole) -> Result<Arc<dyn ModelEndpoint>, ModelError> {
        self.endpoints
            .get(&role)
            .cloned()
            .ok_or_else(|| ModelError::ApiRequest {
                message: format!("no endpoint bound for role '{role}'"),
            })
    }
}

/// A mock model endpoint for testing and development.
///
/// Returns queued responses in order; when the queue is empty, returns a
/// fixed placeholder. Every received prompt is recorded for assertions.
pub struct MockModelEndpoint {
    responses: std::sync::Mutex<Vec<Result<String, ModelError>>>,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl MockModelEndpoint {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(Vec::new()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue a text response for the next `complete` call.
    pub fn queue_text(&self, text: impl Into<String>) {
        self.responses.lock().unwrap().push(Ok(text.into()));
    }

    /// Queue an error for the next `complete` call.
    pub fn queue_error(&self, error: ModelError) {
        self.responses.lock().unwrap().push(Err(error));
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for MockModelEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelEndpoint for MockModelEndpoint {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let mut responses = self.responses.lock().unwrap();
        let result = if responses.is_empty() {
            Ok("mock response".to_string())
        } else {
            responses.remove(0)
        };
        result.map(|text| {
            let output_tokens = text.len() / 4;
            ModelResponse {
                text,
                usage: TokenUsage {
                    input_tokens: request.prompt.len() / 4,
                    output_tokens,
                },
            }
        })
    }

    async fn complete_streaming(
        &self,
        request: ModelRequest,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<ModelResponse, ModelError> {
        let response = self.complete(request).await?;
        for word in response.text.split_inclusive(' ') {
            let _ = tx.send(word.to_string());
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        "mock-model"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_temperatures() {
        assert!((ModelRole::Planner.temperature() - 0.3).abs() < f32::EPSILON);
        assert!((ModelRole::SearcherAnalyzer.temperature() - 0.5).abs() < f32::EPSILON);
        assert!((ModelRole::Analyzer.temperature() - 0.3).abs() < f32::EPSILON);
        assert!((ModelRole::Writer.temperature() - 0.7).abs() < f32::EPSILON);
        assert!((ModelRole::Critic.temperature() - 0.2).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_mock_queued_responses_in_order() {
        let mock = MockModelEndpoint::new();
        mock.queue_text("first");
        mock.queue_text("second");
        let r1 = mock
            .complete(ModelRequest::for_role(ModelRole::Planner, "p"))
            .await
            .unwrap();
        let r2 = mock
            .complete(ModelRequest::for_role(ModelRole::Planner, "p"))
            .await
            .unwrap();
        assert_eq!(r1.text, "first");
        assert_eq!(r2.text, "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let mock = Arc::new(MockModelEndpoint::new());
        mock.queue_error(ModelError::Connection {
            message: "reset".into(),
        });
        mock.queue_text("recovered");

        let set = ModelSet::uniform(mock.clone()).with_retry_config(RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
        });
        let response = set
            .complete(ModelRole::Analyzer, "prompt", 1_000)
            .await
            .unwrap();
        assert_eq!(response.text, "recovered");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_permanent() {
        let mock = Arc::new(MockModelEndpoint::new());
        mock.queue_error(ModelError::AuthFailed {
            endpoint: "writer".into(),
        });
        mock.queue_text("never reached");

        let set = ModelSet::uniform(mock.clone());
        let result = set.complete(ModelRole::Writer, "prompt", 1_000).await;
        assert!(matches!(result, Err(ModelError::AuthFailed { .. })));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_streaming_forwards_tokens() {
        let mock = Arc::new(MockModelEndpoint::new());
        mock.queue_text("alpha beta gamma");
        let set = ModelSet::uniform(mock);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = set
            .complete_streaming(ModelRole::Writer, "p", 1_000, tx)
            .await
            .unwrap();
        assert_eq!(response.text, "alpha beta gamma");

        let mut streamed = String::new();
        while let Ok(tok) = rx.try_recv() {
            streamed.push_str(&tok);
        }
        assert_eq!(streamed, "alpha beta gamma");
    }

    #[tokio::test]
    async fn test_complete_times_out() {
        struct SlowModel;
        #[async_trait]
        impl ModelEndpoint for SlowModel {
            async fn complete(&self, _req: ModelRequest) -> Result<ModelResponse, ModelError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                unreachable!()
            }
            fn name(&self) -> &str {
                "slow"
            }
        }

        let set = ModelSet::uniform(Arc::new(SlowModel)).with_retry_config(RetryConfig {
            max_retries: 0,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
        });
        tokio::time::pause();
        let fut = set.complete(ModelRole::Critic, "p", 50);
        let result = fut.await;
        assert!(matches!(result, Err(ModelError::Timeout { .. })));
    }
}
