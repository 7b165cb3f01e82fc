//! OpenAI-compatible model endpoint.
//!
//! Works against OpenAI, Azure OpenAI, Ollama, vLLM, and any server that
//! follows the chat completions API format.

use async_trait::async_trait;
use delver_core::error::ModelError;
use delver_core::model::{ModelEndpoint, ModelRequest, ModelResponse, TokenUsage};
use serde_json::json;

/// A chat-completions endpoint identified by base URL, model, and API key.
pub struct OpenAiCompatibleEndpoint {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleEndpoint {
    /// Create an endpoint. `base_url` is the API root, e.g.
    /// `https://api.openai.com/v1` or `http://localhost:11434/v1`.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ModelError::Connection {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Create an endpoint reading the API key from an environment variable.
    pub fn from_env(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key_env: &str,
    ) -> Result<Self, ModelError> {
        let api_key = std::env::var(api_key_env).map_err(|_| ModelError::AuthFailed {
            endpoint: format!("env var '{api_key_env}' not set"),
        })?;
        Self::new(base_url, model, api_key)
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiCompatibleEndpoint {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        tracing::debug!(url = %url, model = %self.model, "Sending completion request");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout { timeout_ms: 0 }
                } else {
                    ModelError::Connection {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| ModelError::ApiRequest {
            message: format!("failed to read response body: {e}"),
        })?;

        match status.as_u16() {
            200..=299 => {}
            401 | 403 => {
                return Err(ModelError::AuthFailed {
                    endpoint: self.model.clone(),
                })
            }
            429 => {
                return Err(ModelError::RateLimited {
                    retry_after_secs: 30,
                })
            }
            500..=599 => {
                return Err(ModelError::Connection {
                    message: format!("HTTP {status}"),
                })
            }
            _ => {
                return Err(ModelError::ApiRequest {
                    message: format!("HTTP {status}: {response_body}"),
                })
            }
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&response_body).map_err(|e| ModelError::ResponseParse {
                message: format!("invalid JSON: {e}"),
            })?;

        let text = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelError::ResponseParse {
                message: "missing choices[0].message.content".into(),
            })?
            .to_string();

        let usage = TokenUsage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as usize,
        };

        Ok(ModelResponse { text, usage })
    }

    fn name(&self) -> &str {
        &self.model
    }
}
